//! ASAP/ENRP message codec.
//!
//! [`encode`] turns an [`RSerPoolMessage`](crate::message::RSerPoolMessage)
//! into one datagram plus the PPID to send it with. [`decode`] does the
//! reverse and reports every rejection as a [`DecodeFailure`] that carries
//! enough context to answer the sender with an Error message.
//!
//! Unknown or misplaced parameters are handled by the two action bits of
//! their type code:
//!
//! | bits | action                                                     |
//! |------|------------------------------------------------------------|
//! | `00` | stop, discard the message silently                         |
//! | `01` | stop, discard and report `UnrecognizedParameter`           |
//! | `10` | skip the parameter                                         |
//! | `11` | skip and keep the parameter in `unrecognized_parameters`   |

mod decode;
mod encode;

pub use decode::{decode, DecodeFailure};
pub use encode::{encode, EncodedMessage};
