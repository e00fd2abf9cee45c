pub mod config;
pub mod feed;
pub mod gateway;
pub mod poller;
pub mod store;
pub mod transport;

#[cfg(test)]
mod feed_tests;
#[cfg(test)]
mod test_support;

pub use config::{
    ChannelConfig, Credentials, DeviceConfig, DeviceConfigPatch, Endpoints, PollerConfig,
};
pub use feed::{
    latest_metrics, normalize_record, FeedRecord, FeedResponse, FieldKind, FieldSpec,
    NormalizedSample, FIELD_TABLE,
};
pub use gateway::{Banner, BannerAction, Gateway, OutcomeKind, ReadingsOutcome};
pub use poller::{PollQuality, PollSnapshot, Poller, PollerPhase};
pub use store::{ConfigStore, SavedCode, StoreError, UserRecord, UserStore};
pub use transport::{decode_feed, FeedTransport, HttpTransport, TransportError};
