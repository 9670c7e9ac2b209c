//! Planning poker session core: participants, the per-session state machine,
//! vote visibility, and the registry that maps session ids to live sessions.

pub mod errors;
pub mod ids;
pub mod message;
pub mod outbound;
pub mod registry;
pub mod session;
pub mod user;

pub use errors::RouteError;
pub use ids::{SessionId, UserId};
pub use message::{Envelope, MessageKind, ServerEvent};
pub use outbound::{DeliveryError, Frame, Outbound};
pub use registry::Registry;
pub use session::{Session, SessionState, SessionStatus, SESSION_STARTED_NOTICE, WAITING_ROOM_NOTICE};
pub use user::{UserView, Vote, HIDDEN_VOTE};
