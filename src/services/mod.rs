//! External collaborators: account service, live broadcast and service tokens

pub mod accounts;
pub mod broadcast;
pub mod token;

pub use accounts::{AccountClient, IdentityService, WorkspaceDirectory, WorkspaceInfo};
pub use broadcast::{
    transactor_http_endpoint, LiveNotifier, NoopNotifier, NotifierFactory, TransactorBroadcaster,
    TransactorNotifierFactory,
};
pub use token::{ServiceClaims, TokenIssuer};
