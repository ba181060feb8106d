//! Microsoft Graph adapter for SharePoint document libraries.
//!
//! [`GraphClient`] resolves sites, items and folder listings; it also acts as
//! the [`MetadataSource`] and [`SourceOpener`] the transfer engine needs.
//! [`HttpChunkSource`] issues ranged content requests. [`SharePointClient`]
//! ties both to a [`TransferSession`] for one-call downloads.
//!
//! [`MetadataSource`]: spfetch_transfer::MetadataSource
//! [`SourceOpener`]: spfetch_transfer::SourceOpener
//! [`TransferSession`]: spfetch_transfer::TransferSession

pub mod client;
pub mod error;
pub mod sharepoint;
pub mod source;
pub mod types;

#[cfg(test)]
mod mock;

pub use client::GraphClient;
pub use error::{GraphError, classify_status, parse_retry_after};
pub use sharepoint::SharePointClient;
pub use source::HttpChunkSource;
pub use types::{DriveItem, ItemLocator, ListedItem, Page, Site};

/// Graph v1.0 endpoint.
pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
