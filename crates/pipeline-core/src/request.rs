//! Image request descriptor.

use url::Url;

/// Where the image bytes come from.
///
/// The assembled pipeline only fetches `Network` sources; `Disk` and
/// `Local` classify requests for callers that route them to their own
/// producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Fetched over the network (http/https).
    Network,
    /// Read from a local file (file://).
    Disk,
    /// Anything else: content providers, assets, resources.
    Local,
}

/// An inclusive byte range for partial fetches.
///
/// `to = None` means "until the end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BytesRange {
    pub from: u64,
    pub to: Option<u64>,
}

impl BytesRange {
    pub fn from_offset(from: u64) -> BytesRange {
        BytesRange { from, to: None }
    }

    /// Renders the range as an HTTP `Range` header value.
    pub fn to_http_range_header(&self) -> String {
        match self.to {
            Some(to) => format!("bytes={}-{}", self.from, to),
            None => format!("bytes={}-", self.from),
        }
    }
}

/// Immutable description of one logical image request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRequest {
    uri: Url,
    source: SourceKind,
    progressive_rendering_enabled: bool,
    bytes_range: Option<BytesRange>,
}

impl ImageRequest {
    /// Builds a request for `uri`, inferring the source kind from the scheme.
    pub fn new(uri: Url) -> ImageRequest {
        let source = match uri.scheme() {
            "http" | "https" => SourceKind::Network,
            "file" => SourceKind::Disk,
            _ => SourceKind::Local,
        };
        ImageRequest {
            uri,
            source,
            progressive_rendering_enabled: false,
            bytes_range: None,
        }
    }

    pub fn with_progressive_rendering(mut self, enabled: bool) -> ImageRequest {
        self.progressive_rendering_enabled = enabled;
        self
    }

    /// Restricts the request to a byte range, e.g. to continue a partial
    /// fetch where a previous one left off.
    pub fn with_bytes_range(mut self, range: BytesRange) -> ImageRequest {
        self.bytes_range = Some(range);
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn progressive_rendering_enabled(&self) -> bool {
        self.progressive_rendering_enabled
    }

    pub fn bytes_range(&self) -> Option<BytesRange> {
        self.bytes_range
    }

    /// Key under which results for this request may be cached and
    /// multiplexed. Requests differing only in priority or prefetch status
    /// share a key; requests with different byte ranges do not.
    pub fn cache_key(&self) -> String {
        match self.bytes_range {
            Some(range) => format!("{}@{}", self.uri, range.to_http_range_header()),
            None => self.uri.to_string(),
        }
    }
}
