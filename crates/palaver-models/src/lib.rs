pub mod call;
pub mod gateway;
pub mod ids;
pub mod message;
pub mod user;

pub use call::{CallChannel, CallPeer};
pub use gateway::{ClientEvent, PulseEcho, ServerEvent, TargetParts};
pub use message::{ChatTarget, FileMeta, MediaKind, Message, MessageKind, MessageStatus};
pub use user::User;
