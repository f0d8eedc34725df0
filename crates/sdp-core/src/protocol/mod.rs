//! Protocol module containing the knock and grant message types and the
//! binary codec.

pub mod codec;
pub mod messages;

pub use codec::{
    compute_tag, decode_knock, open_grant, seal_grant, seal_knock, verify_tag, DecodedKnock,
    ProtocolError,
};
pub use messages::*;
