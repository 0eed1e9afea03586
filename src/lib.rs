pub mod amount;
pub mod clock;
pub mod config;
pub mod csv;
pub mod desk;
pub mod inbox;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod store;

pub use amount::Amount;
pub use config::Config;
pub use desk::{Desk, DeskError};
pub use model::{
    Command, ConversationId, Deal, DealId, DealStatus, ListingId, Offer, OfferId, OfferStatus,
    Stage, UserId,
};
