//! Property tests for outbox ordering and state machine transitions

mod common;

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use proptest::prelude::*;

use common::{MockTransport, RecordingEventHandler};
use uplink_session::state::StateMachineTimeouts;
use uplink_session::{
    BoundedPriorityOutbox, MessageBlock, MessageBlockWithMetadata, MessagePriority, SessionState,
    SessionStateMachine,
};

fn priority_strategy() -> impl Strategy<Value = MessagePriority> {
    (0..MessagePriority::COUNT).prop_map(|i| MessagePriority::ALL[i])
}

fn item(seq: u32, priority: MessagePriority) -> MessageBlockWithMetadata {
    MessageBlockWithMetadata::new(0, MessageBlock::new(1, seq.to_be_bytes().to_vec()), priority)
}

fn seq_of(item: &MessageBlockWithMetadata) -> u32 {
    let data = item.block.data();
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

#[derive(Debug, Clone)]
enum OutboxOp {
    Submit(MessagePriority),
    Take,
}

fn outbox_op_strategy() -> impl Strategy<Value = OutboxOp> {
    prop_oneof![
        3 => priority_strategy().prop_map(OutboxOp::Submit),
        2 => Just(OutboxOp::Take),
    ]
}

#[derive(Debug, Clone, Copy)]
enum StateOp {
    ClientHandshake,
    ServerHandshake,
    HandshakeSuccessful,
    HandshakeFailed,
    RemoteGoodbye,
    OwnGoodbye,
    IncomingClosed,
    OutgoingClosed,
    UncleanShutdownInitiated,
}

fn state_op_strategy() -> impl Strategy<Value = StateOp> {
    prop_oneof![
        Just(StateOp::ClientHandshake),
        Just(StateOp::ServerHandshake),
        Just(StateOp::HandshakeSuccessful),
        Just(StateOp::HandshakeFailed),
        Just(StateOp::RemoteGoodbye),
        Just(StateOp::OwnGoodbye),
        Just(StateOp::IncomingClosed),
        Just(StateOp::OutgoingClosed),
        Just(StateOp::UncleanShutdownInitiated),
    ]
}

/// Apply one operation; returns whether it reported an error
fn apply(machine: &SessionStateMachine, op: StateOp) -> bool {
    match op {
        StateOp::ClientHandshake => machine.mark_client_handshake_sent_or_received().is_err(),
        StateOp::ServerHandshake => machine.mark_server_handshake_sent_or_received().is_err(),
        StateOp::HandshakeSuccessful => machine.mark_handshake_successful().is_err(),
        StateOp::HandshakeFailed => machine.mark_handshake_failed().is_err(),
        StateOp::RemoteGoodbye => machine.mark_remote_side_has_sent_goodbye().is_err(),
        StateOp::OwnGoodbye => machine.mark_own_goodbye_sent().is_err(),
        StateOp::IncomingClosed => machine.mark_incoming_stream_closed_or_eof().is_err(),
        StateOp::OutgoingClosed => machine.mark_outgoing_stream_closed().is_err(),
        StateOp::UncleanShutdownInitiated => machine.mark_unclean_shutdown_initiated().is_err(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    #[test]
    fn strict_priority_and_fifo_after_bulk_submit(
        priorities in proptest::collection::vec(priority_strategy(), 0..64)
    ) {
        let capacities: BTreeMap<_, _> = MessagePriority::ALL.iter().map(|&p| (p, 64)).collect();
        let outbox = BoundedPriorityOutbox::new("prop", &capacities).unwrap();
        for (seq, priority) in priorities.iter().enumerate() {
            outbox.submit_or_fail(item(seq as u32, *priority)).unwrap();
        }

        let taken: Vec<(MessagePriority, u32)> = std::iter::from_fn(|| outbox.take_next())
            .map(|i| (i.priority, seq_of(&i)))
            .collect();
        prop_assert_eq!(taken.len(), priorities.len());

        // highest priority first, submission order within a level
        let mut expected: Vec<(MessagePriority, u32)> = priorities
            .iter()
            .enumerate()
            .map(|(seq, p)| (*p, seq as u32))
            .collect();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        prop_assert_eq!(taken, expected);
    }

    #[test]
    fn interleaved_operations_match_model(
        ops in proptest::collection::vec(outbox_op_strategy(), 0..128),
        capacity in 1usize..6,
    ) {
        let capacities: BTreeMap<_, _> = MessagePriority::ALL.iter().map(|&p| (p, capacity)).collect();
        let outbox = BoundedPriorityOutbox::new("prop", &capacities).unwrap();
        let mut model: Vec<VecDeque<u32>> = vec![VecDeque::new(); MessagePriority::COUNT];

        for (seq, op) in ops.into_iter().enumerate() {
            let seq = seq as u32;
            match op {
                OutboxOp::Submit(priority) => {
                    let queue = &mut model[priority.index()];
                    let result = outbox.submit_or_fail(item(seq, priority));
                    if queue.len() < capacity {
                        prop_assert!(result.is_ok());
                        queue.push_back(seq);
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
                OutboxOp::Take => {
                    let expected = model.iter_mut().rev().find_map(|queue| queue.pop_front());
                    let taken = outbox.take_next().map(|i| seq_of(&i));
                    prop_assert_eq!(taken, expected);
                }
            }
            for priority in MessagePriority::ALL {
                prop_assert_eq!(outbox.len(priority), model[priority.index()].len());
            }
        }
    }

    #[test]
    fn state_only_advances_along_the_lifecycle_graph(
        ops in proptest::collection::vec(state_op_strategy(), 0..40)
    ) {
        let transport = MockTransport::new();
        let events = RecordingEventHandler::new();
        let timeouts = StateMachineTimeouts {
            handshake_response: Duration::from_secs(10),
            heartbeat_response: Duration::from_secs(30),
        };
        let machine = SessionStateMachine::new("p1", timeouts, transport.clone(), events.clone());

        for op in ops {
            let before = machine.state();
            let failed = apply(&machine, op);
            if failed {
                prop_assert_eq!(machine.state(), before);
            }
            if before.is_terminal() {
                prop_assert_eq!(machine.state(), before);
            }
        }

        let changes = events.changes.lock().clone();
        let mut current = SessionState::Initial;
        for (old, new) in &changes {
            prop_assert_eq!(*old, current);
            prop_assert!(old.can_transition_to(*new), "{} -> {}", old, new);
            current = *new;
        }
        prop_assert_eq!(current, machine.state());

        let terminal = events.terminal_events();
        if machine.state().is_terminal() {
            prop_assert_eq!(terminal, vec![(machine.state(), None)]);
            prop_assert_eq!(transport.terminations(), 1);
        } else {
            prop_assert!(terminal.is_empty());
            prop_assert_eq!(transport.terminations(), 0);
        }
    }
}
