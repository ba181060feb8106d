//! Graph response types and item addressing.

use std::fmt;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Characters left unescaped inside one path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A SharePoint site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hashes {
    #[serde(default)]
    pub sha256_hash: Option<String>,
    #[serde(default)]
    pub quick_xor_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub hashes: Option<Hashes>,
}

/// Metadata of a file or folder in a document library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub web_url: Option<String>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }

    /// Hex SHA-256 of the content, when the service reports one.
    pub fn sha256(&self) -> Option<&str> {
        self.file
            .as_ref()?
            .hashes
            .as_ref()?
            .sha256_hash
            .as_deref()
    }
}

/// One page of a collection response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Flattened folder entry returned by `ls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedItem {
    pub name: String,
    pub is_folder: bool,
    pub size: u64,
    pub id: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub web_url: Option<String>,
}

impl From<DriveItem> for ListedItem {
    fn from(item: DriveItem) -> Self {
        Self {
            is_folder: item.is_folder(),
            size: item.size.unwrap_or(0),
            name: item.name,
            id: item.id,
            last_modified: item.last_modified_date_time,
            web_url: item.web_url,
        }
    }
}

/// Addresses an item by site id and path inside the site's default drive.
///
/// Its [`object_id`](Self::object_id) is the Graph item path, which is what
/// the transfer engine passes back to the metadata and content requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLocator {
    site_id: String,
    path: String,
}

impl ItemLocator {
    /// `path` is normalized: empty and repeated separators collapse, and the
    /// drive root is `/`.
    pub fn new(site_id: impl Into<String>, path: &str) -> Self {
        Self {
            site_id: site_id.into(),
            path: normalize_path(path),
        }
    }

    /// Parses an id produced by [`object_id`](Self::object_id).
    pub fn from_object_id(object_id: &str) -> Result<Self, GraphError> {
        let invalid = || GraphError::Protocol(format!("not a drive item path: {object_id}"));
        let rest = object_id.strip_prefix("/sites/").ok_or_else(invalid)?;
        let (site_id, tail) = rest.split_once("/drive/root").ok_or_else(invalid)?;
        if site_id.is_empty() {
            return Err(invalid());
        }
        let path = match tail {
            "" => "/".to_string(),
            _ => {
                let encoded = tail.strip_prefix(':').ok_or_else(invalid)?;
                percent_decode_str(encoded)
                    .decode_utf8()
                    .map_err(|_| invalid())?
                    .into_owned()
            }
        };
        Ok(Self::new(site_id, &path))
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Normalized, unencoded path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    pub fn object_id(&self) -> String {
        self.item_path()
    }

    pub fn item_path(&self) -> String {
        if self.is_root() {
            format!("/sites/{}/drive/root", self.site_id)
        } else {
            format!("/sites/{}/drive/root:{}", self.site_id, encode_path(&self.path))
        }
    }

    pub fn content_path(&self) -> String {
        format!("{}:/content", self.item_path())
    }

    pub fn children_path(&self) -> String {
        if self.is_root() {
            format!("{}/children", self.item_path())
        } else {
            format!("{}:/children", self.item_path())
        }
    }
}

impl fmt::Display for ItemLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.item_path())
    }
}

pub(crate) fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .trim()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}

pub(crate) fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_paths() {
        let loc = ItemLocator::new("site-1", "Shared Documents/reports/q1.csv");
        assert_eq!(loc.path(), "/Shared Documents/reports/q1.csv");
        assert_eq!(
            loc.item_path(),
            "/sites/site-1/drive/root:/Shared%20Documents/reports/q1.csv"
        );
        assert_eq!(
            loc.content_path(),
            "/sites/site-1/drive/root:/Shared%20Documents/reports/q1.csv:/content"
        );
        assert_eq!(
            loc.children_path(),
            "/sites/site-1/drive/root:/Shared%20Documents/reports/q1.csv:/children"
        );
    }

    #[test]
    fn root_locator() {
        for path in ["", "/", "//", "  "] {
            let loc = ItemLocator::new("s", path);
            assert!(loc.is_root());
            assert_eq!(loc.item_path(), "/sites/s/drive/root");
            assert_eq!(loc.children_path(), "/sites/s/drive/root/children");
        }
    }

    #[test]
    fn object_id_parses_back() {
        let loc = ItemLocator::new("host,abc,def", "/a b/ü#1.txt");
        let parsed = ItemLocator::from_object_id(&loc.object_id()).unwrap();
        assert_eq!(parsed, loc);

        let root = ItemLocator::new("s", "/");
        assert_eq!(ItemLocator::from_object_id(&root.object_id()).unwrap(), root);
    }

    #[test]
    fn object_id_rejects_foreign_ids() {
        assert!(ItemLocator::from_object_id("data.csv").is_err());
        assert!(ItemLocator::from_object_id("/sites//drive/root:/x").is_err());
        assert!(ItemLocator::from_object_id("/sites/s/drive/rootx").is_err());
    }

    #[test]
    fn drive_item_facets() {
        let json = r#"{
            "id": "01ABC",
            "name": "data.csv",
            "size": 1234,
            "file": {"mimeType": "text/csv", "hashes": {"sha256Hash": "ABCDEF"}},
            "lastModifiedDateTime": "2024-03-01T12:30:00Z",
            "webUrl": "https://contoso.sharepoint.com/data.csv"
        }"#;
        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert!(!item.is_folder());
        assert_eq!(item.sha256(), Some("ABCDEF"));
        let listed = ListedItem::from(item);
        assert_eq!(listed.size, 1234);
        assert_eq!(
            listed.last_modified.unwrap().to_rfc3339(),
            "2024-03-01T12:30:00+00:00"
        );

        let folder: DriveItem =
            serde_json::from_str(r#"{"id":"F","name":"reports","folder":{"childCount":3}}"#).unwrap();
        assert!(folder.is_folder());
        assert_eq!(ListedItem::from(folder).size, 0);
    }

    #[test]
    fn page_next_link() {
        let page: Page<Site> = serde_json::from_str(
            r#"{"value":[{"id":"a"}],"@odata.nextLink":"https://next"}"#,
        )
        .unwrap();
        assert_eq!(page.value.len(), 1);
        assert_eq!(page.next_link.as_deref(), Some("https://next"));

        let last: Page<Site> = serde_json::from_str(r#"{"value":[]}"#).unwrap();
        assert!(last.next_link.is_none());
    }
}
