//! Data model: upstream wire records, the canonical parsed-stream record,
//! provider descriptors and the user configuration consumed by the pipeline.

pub mod config;
pub mod playback;
pub mod provider;
pub mod stream;

pub use config::{
    CatalogFilter, DedupConfig, DedupKey, DedupMode, FilterConfig, FormatConfig, GroupBehaviour,
    MultiGroupBehaviour, ProviderGroup, ProxyConfig, SeedersFilter, SeedersScope, SizeFilter,
    SizeRange, SortConfig, SortCriterion, SortDirection, SortKey, StreamExpressionFilter,
    UserConfig,
};
pub use playback::{FileInfo, StoreAuth, TitleMetadata};
pub use provider::{MediaType, ProviderDescriptor, Resource, ServiceCredential, ServiceId};
pub use stream::{
    AddonRef, BehaviorHints, ParsedFile, ParsedStream, RawStream, ServiceRef, StreamError,
    StreamType, Subtitle, TorrentInfo,
};
