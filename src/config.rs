use std::time::Duration;
use anyhow::bail;

pub const DEFAULT_RANGE_CHUNK_SIZE: u64 = 65536;

#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Size of the chunks the remote side requests via range requests. A document needs to be
    ///  bigger than twice this size for range requests to be worth it - below that, a single
    ///  full fetch is cheaper.
    pub range_chunk_size: u64,

    /// Never use range requests, even if the origin supports them.
    pub disable_range: bool,

    /// Do not stream the full response progressively. If range requests are supported, the full
    ///  request is cancelled as soon as its headers are known, and all data is loaded via ranges.
    pub disable_stream: bool,

    /// Only fetch data the remote side asks for rather than fetching the rest of the document
    ///  in the background.
    pub disable_auto_fetch: bool,

    /// Additional request headers for network origins. Ignored for local files.
    pub http_headers: Vec<(String, String)>,

    /// Content length known up front (e.g. from an embedding application). Origin metadata
    ///  takes precedence once it is known.
    pub content_length: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            range_chunk_size: DEFAULT_RANGE_CHUNK_SIZE,
            disable_range: false,
            disable_stream: false,
            disable_auto_fetch: false,
            http_headers: Vec::new(),
            content_length: None,
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.range_chunk_size == 0 {
            bail!("range_chunk_size must be an integer larger than zero");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// logical name of this side - incoming messages with a different target are ignored
    pub source_name: String,
    pub target_name: String,

    /// the consumer's high water mark for streams opened without explicit queue hints
    pub default_high_water_mark: i64,
}

impl EndpointConfig {
    pub fn new(source_name: &str, target_name: &str) -> EndpointConfig {
        EndpointConfig {
            source_name: source_name.to_string(),
            target_name: target_name.to_string(),
            default_high_water_mark: 1,
        }
    }

    pub fn main() -> EndpointConfig {
        Self::new("main", "worker")
    }

    pub fn worker() -> EndpointConfig {
        Self::new("worker", "main")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source_name.is_empty() || self.target_name.is_empty() {
            bail!("endpoint names must not be empty");
        }
        if self.source_name == self.target_name {
            bail!("source and target name are both {:?} - an endpoint would receive its own messages", self.source_name);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RenderConfig {
    /// wall clock budget for a single slice of operator execution before yielding
    pub time_slice: Duration,
    /// upper bound on operators per slice, independent of time - keeps slices bounded under
    ///  a paused clock
    pub max_ops_per_slice: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            time_slice: Duration::from_millis(15),
            max_ops_per_slice: 4096,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_ops_per_slice == 0 {
            bail!("max_ops_per_slice must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct TransportConfig {
    pub source: SourceConfig,
    pub render: RenderConfig,
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.source.validate()?;
        self.render.validate()
    }
}
