//! Remote item references and resource selection

use serde::{Deserialize, Serialize};

/// Maximum number of title characters kept in local file names
const TITLE_PREFIX_CHARS: usize = 57;

/// Formats that are references to an external player, not media bytes
const EXTERNAL_FORMATS: &[&str] = &["youtube", "embed"];

/// Streaming manifest format, never downloaded
const MANIFEST_FORMAT: &str = "m3u8";

/// Kind of a remote object, from the first character of its oid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Video,
    Live,
    Photo,
    Channel,
    Unknown,
}

/// Reference to a remote media or channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub oid: String,
    #[serde(default)]
    pub title: String,
}

impl RemoteItem {
    pub fn new(oid: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            title: title.into(),
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self.oid.chars().next() {
            Some('v') => ItemKind::Video,
            Some('l') => ItemKind::Live,
            Some('p') => ItemKind::Photo,
            Some('c') => ItemKind::Channel,
            _ => ItemKind::Unknown,
        }
    }

    /// Base name for local files: `"{short title} - {oid}"`
    ///
    /// The title is cut to 57 characters, `/` becomes `|`, and leading or
    /// trailing spaces and dashes are dropped. An empty title gives the oid
    /// alone.
    pub fn file_prefix(&self) -> String {
        let short: String = self.title.chars().take(TITLE_PREFIX_CHARS).collect();
        let short = short.replace('/', "|");
        let short = short.trim_matches(|c| c == ' ' || c == '-');
        if short.is_empty() {
            self.oid.clone()
        } else {
            format!("{} - {}", short, self.oid)
        }
    }

    /// Short description used in log messages
    pub fn label(&self) -> String {
        if self.title.is_empty() {
            self.oid.clone()
        } else {
            format!("{} {}", self.oid, self.title)
        }
    }
}

/// One transcoded variant of a media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaResource {
    /// File name, or the external reference for external formats
    pub file: String,
    /// Server-side path passed to the download endpoint
    #[serde(default)]
    pub path: String,
    pub format: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Variant used by the player
    #[serde(default)]
    pub used_for_display: bool,
}

impl MediaResource {
    pub fn is_external(&self) -> bool {
        EXTERNAL_FORMATS.contains(&self.format.as_str())
    }

    /// Suffix appended to the file prefix: `-{width}x{height}.{format}`
    pub fn file_suffix(&self) -> String {
        format!(
            "-{}x{}.{}",
            self.width.unwrap_or(0),
            self.height.unwrap_or(0),
            self.format
        )
    }
}

/// Pick the variant to download
///
/// Manifests are never eligible; with `must_be_playable` only variants used
/// by the player are. The largest eligible media variant wins; external
/// references are chosen only when no media variant is eligible. Ties keep
/// the first variant listed.
pub fn select_best_resource(resources: &[MediaResource], must_be_playable: bool) -> Option<&MediaResource> {
    let eligible = |res: &&MediaResource| res.format != MANIFEST_FORMAT && (!must_be_playable || res.used_for_display);
    let largest = |external: bool| {
        resources
            .iter()
            .filter(eligible)
            .filter(|res| res.is_external() == external)
            .fold(None::<&MediaResource>, |best, res| match best {
                Some(b) if b.file_size >= res.file_size => Some(b),
                _ => Some(res),
            })
    };
    largest(false).or_else(|| largest(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(format: &str, size: u64, display: bool) -> MediaResource {
        MediaResource {
            file: format!("media_{}.{}", size, format),
            path: format!("/res/{}", size),
            format: format.to_string(),
            file_size: size,
            width: Some(1280),
            height: Some(720),
            used_for_display: display,
        }
    }

    #[test]
    fn test_kind_from_oid() {
        assert_eq!(RemoteItem::new("v1263", "").kind(), ItemKind::Video);
        assert_eq!(RemoteItem::new("c12", "").kind(), ItemKind::Channel);
        assert_eq!(RemoteItem::new("", "").kind(), ItemKind::Unknown);
    }

    #[test]
    fn test_file_prefix() {
        let item = RemoteItem::new("v125", "Intro / part 1 - ");
        assert_eq!(item.file_prefix(), "Intro | part 1 - v125");

        let long = RemoteItem::new("v1", "a".repeat(80));
        assert_eq!(long.file_prefix(), format!("{} - v1", "a".repeat(57)));

        let unicode = RemoteItem::new("v2", "Présentation été");
        assert_eq!(unicode.file_prefix(), "Présentation été - v2");

        assert_eq!(RemoteItem::new("v3", " - ").file_prefix(), "v3");
    }

    #[test]
    fn test_best_resource_is_largest_media() {
        let list = vec![
            resource("mp4", 100, true),
            resource("m3u8", 10_000, true),
            resource("mp4", 500, false),
            resource("youtube", 0, false),
        ];
        assert_eq!(select_best_resource(&list, false).unwrap().file_size, 500);
        assert_eq!(select_best_resource(&list, true).unwrap().file_size, 100);
    }

    #[test]
    fn test_external_only_as_fallback() {
        let list = vec![resource("m3u8", 10, true), resource("embed", 40, true)];
        assert_eq!(select_best_resource(&list, false).unwrap().format, "embed");
    }

    #[test]
    fn test_no_playable_variant() {
        let list = vec![resource("mp4", 100, false)];
        assert!(select_best_resource(&list, true).is_none());
        assert!(select_best_resource(&[], false).is_none());
    }

    #[test]
    fn test_resource_deserialize_defaults() {
        let res: MediaResource = serde_json::from_value(serde_json::json!({
            "file": "abc",
            "format": "youtube"
        }))
        .unwrap();
        assert!(res.is_external());
        assert_eq!(res.file_suffix(), "-0x0.youtube");
    }
}
