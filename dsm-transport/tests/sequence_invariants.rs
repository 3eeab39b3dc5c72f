//! Randomized driver over `SequenceState::advance`: whatever sequence of
//! tags is fed in, the state machine must never land somewhere that lets
//! `PUT_DATA` arrive without a preceding `PUT_OFFSET`, and only ever errors
//! on the exact transitions the protocol forbids.

use dsm_transport::protocol::{ProtocolError, SequenceState, Tag};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn tag_from_index(i: u32) -> Tag {
    match i % 5 {
        0 => Tag::Terminate,
        1 => Tag::PutOffset,
        2 => Tag::PutData,
        3 => Tag::Get,
        _ => Tag::Response,
    }
}

#[test]
fn random_tag_streams_only_fail_on_put_data_without_offset() {
    let mut rng = SmallRng::seed_from_u64(0x1357_9BDF);
    for _ in 0..200 {
        let mut state = SequenceState::Idle;
        for _ in 0..200 {
            let tag = tag_from_index(rng.gen::<u32>());
            match state.advance(tag) {
                Ok(next) => {
                    if tag == Tag::PutOffset {
                        assert_eq!(next, SequenceState::AwaitingPutData);
                    } else {
                        assert_eq!(next, SequenceState::Idle);
                    }
                    state = next;
                }
                Err(ProtocolError::OutOfSequence { got, state: at }) => {
                    assert_eq!(got, tag);
                    // The only forbidden transitions are PUT_DATA/GET/TERMINATE
                    // arriving while AwaitingPutData, or PUT_DATA arriving
                    // from Idle.
                    assert!(
                        at == SequenceState::AwaitingPutData || (at == SequenceState::Idle && tag == Tag::PutData)
                    );
                    // an error leaves the driver's local `state` unchanged
                    // since `advance` takes `self` by value and only a
                    // successful call produces the next state.
                }
                Err(other) => panic!("unexpected error variant: {other:?}"),
            }
        }
    }
}
