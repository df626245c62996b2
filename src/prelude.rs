pub use crate::animator::Animator;
pub use crate::config::ServerConfig;
pub use crate::error::SessionError;
pub use crate::session::{Lifecycle, Session, SessionInfo, SessionManager, SubscriberId};
pub use crate::sink::{ChannelSink, FrameSink};
pub use crate::skeleton::{BindPose, SkeletonDescriptor};
