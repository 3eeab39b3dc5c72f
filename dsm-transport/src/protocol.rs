//! The peer-side tagged wire protocol. A PUT is `PUT_OFFSET` immediately
//! followed by `PUT_DATA`; a read is `GET` followed eventually by
//! `RESPONSE`; `TERMINATE` ends the peer's event loop. No other tag
//! sequence is legal.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Terminate = 0,
    PutOffset = 1,
    PutData = 2,
    Get = 3,
    Response = 4,
}

impl Tag {
    pub fn from_u8(v: u8) -> Option<Tag> {
        match v {
            0 => Some(Tag::Terminate),
            1 => Some(Tag::PutOffset),
            2 => Some(Tag::PutData),
            3 => Some(Tag::Get),
            4 => Some(Tag::Response),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unrecognized tag byte {0}")]
    UnknownTag(u8),

    #[error("tag {got:?} is not legal in state {state:?}")]
    OutOfSequence { got: Tag, state: SequenceState },
}

/// The small state machine a peer's event loop runs: a PUT_OFFSET commits
/// to seeing PUT_DATA next; anything else resets to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    AwaitingPutData,
}

impl SequenceState {
    pub fn advance(self, tag: Tag) -> Result<SequenceState, ProtocolError> {
        match (self, tag) {
            (SequenceState::Idle, Tag::PutOffset) => Ok(SequenceState::AwaitingPutData),
            (SequenceState::Idle, Tag::Get) => Ok(SequenceState::Idle),
            (SequenceState::Idle, Tag::Terminate) => Ok(SequenceState::Idle),
            (SequenceState::AwaitingPutData, Tag::PutData) => Ok(SequenceState::Idle),
            (state, got) => Err(ProtocolError::OutOfSequence { got, state }),
        }
    }
}

/// Encode a byte offset for the wire. Canonical (big-endian) order is used
/// whenever the peer set is heterogeneous; otherwise native order, matching
/// the host's own layout since peer and master then share one.
pub fn encode_offset(offset: u64, heterogeneous: bool) -> [u8; 8] {
    if heterogeneous {
        offset.to_be_bytes()
    } else {
        offset.to_ne_bytes()
    }
}

pub fn decode_offset(bytes: [u8; 8], heterogeneous: bool) -> u64 {
    if heterogeneous {
        u64::from_be_bytes(bytes)
    } else {
        u64::from_ne_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_round_trips_in_both_byte_orders() {
        let value = 0x0102_0304_0506_0708u64;
        for heterogeneous in [true, false] {
            let encoded = encode_offset(value, heterogeneous);
            assert_eq!(decode_offset(encoded, heterogeneous), value);
        }
    }

    #[test]
    fn heterogeneous_encoding_is_always_big_endian() {
        let encoded = encode_offset(1, true);
        assert_eq!(encoded, 1u64.to_be_bytes());
    }

    #[test]
    fn put_sequence_requires_offset_before_data() {
        let s = SequenceState::Idle;
        assert!(s.advance(Tag::PutData).is_err());
        let s = s.advance(Tag::PutOffset).unwrap();
        assert_eq!(s, SequenceState::AwaitingPutData);
        let s = s.advance(Tag::PutData).unwrap();
        assert_eq!(s, SequenceState::Idle);
    }

    #[test]
    fn get_and_terminate_are_legal_from_idle_and_stay_idle() {
        assert_eq!(SequenceState::Idle.advance(Tag::Get).unwrap(), SequenceState::Idle);
        assert_eq!(
            SequenceState::Idle.advance(Tag::Terminate).unwrap(),
            SequenceState::Idle
        );
    }

    #[test]
    fn tag_round_trips_through_its_byte() {
        for tag in [Tag::Terminate, Tag::PutOffset, Tag::PutData, Tag::Get, Tag::Response] {
            assert_eq!(Tag::from_u8(tag.as_u8()), Some(tag));
        }
        assert_eq!(Tag::from_u8(200), None);
    }
}
