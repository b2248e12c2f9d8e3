//! parley-services: reliable datagram channel, directory server and peer
//! roles for Parley.

pub mod channel;
pub mod directory;
pub mod dispatch;
pub mod mailbox;
pub mod peer;
pub mod server;
pub mod sim;
pub mod transport;

pub use channel::{ChannelError, Delivery, ReliableChannel};
pub use directory::{
    Directory, DirectoryEntry, DirectoryError, DrainReport, Registration, RouteOutcome,
};
pub use dispatch::{Dispatcher, Handler};
pub use mailbox::Mailbox;
pub use peer::{PeerError, PeerEvent, PeerHandler, PeerNode};
pub use server::{server, ServerHandler};
pub use sim::{Fate, FaultRule, SimNetwork, SimSocket, Transmission, UnitKind};
pub use transport::Datagram;
