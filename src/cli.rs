use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Walk a directory and update its index
    Scan {
        /// Directory to index
        root: PathBuf,

        /// Extensions to index, comma separated (defaults from settings.yaml)
        #[clap(short, long, value_delimiter = ',')]
        extensions: Option<Vec<String>>,

        /// Index every extension
        #[clap(short = 'a', long, default_value = "false")]
        all: bool,

        /// Keep the index somewhere other than <root>/.wayfinder_index
        #[clap(long)]
        storage_dir: Option<PathBuf>,
    },

    /// Embed files that have no vector yet
    Embed {
        /// Index root or storage directory
        index: PathBuf,

        /// Embed at most this many files
        #[clap(short, long)]
        max_files: Option<usize>,

        #[clap(short, long)]
        batch_size: Option<usize>,

        /// Run in a background process and return at once
        #[clap(short, long, default_value = "false")]
        detach: bool,
    },

    /// Show the progress of the latest embedding run
    Progress { index: PathBuf },

    /// Ask the active embedding run to stop after its current batch
    Cancel { index: PathBuf },

    /// Group embedded files with k-means
    Cluster {
        index: PathBuf,

        /// Number of clusters (chosen from the data when omitted)
        #[clap(short)]
        k: Option<usize>,
    },

    /// Show the last clustering result
    Clusters { index: PathBuf },

    /// Hybrid keyword and semantic search
    Search {
        index: PathBuf,

        query: String,

        #[clap(short = 'n', long)]
        top_k: Option<usize>,

        /// 0 = keywords only, 1 = semantic only
        #[clap(short, long)]
        weight: Option<f32>,
    },

    /// Find near-duplicates and versions of the same file
    Similar {
        index: PathBuf,

        /// Minimum cosine similarity, 0..=1
        #[clap(short, long)]
        threshold: Option<f32>,

        /// Relative path that should be kept over newer copies (repeatable)
        #[clap(short, long = "pin")]
        pinned: Vec<String>,

        /// Also print where each candidate would be archived
        #[clap(long)]
        archive_dir: Option<PathBuf>,
    },

    /// Counts, sizes and the active provider
    Stats { index: PathBuf },

    /// Files per modification day, newest first
    Timeline {
        index: PathBuf,

        #[clap(short, long, default_value = "30")]
        days: usize,
    },

    /// Report index consistency problems
    Check { index: PathBuf },

    /// Show recent scan and embedding errors
    Errors {
        index: PathBuf,

        #[clap(short, long, default_value = "50")]
        limit: usize,

        /// Empty the error log
        #[clap(long, default_value = "false")]
        clear: bool,
    },

    /// Embedding provider configuration
    Provider {
        #[clap(subcommand)]
        action: ProviderAction,
    },

    /// Pack the index into a .tar.gz (without credentials or models)
    Export {
        index: PathBuf,

        /// Archive path; stdout when omitted and piped
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Restore an exported archive
    Import {
        /// Archive path; read from stdin when omitted
        archive: Option<PathBuf>,

        /// Storage directory to restore into
        #[clap(short, long)]
        storage_dir: PathBuf,

        /// Skip confirmation
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Serve the HTTP API
    Serve {
        #[clap(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProviderAction {
    /// Show the configured provider (secrets are never printed)
    Show { index: PathBuf },

    /// Replace the provider configuration
    Set {
        index: PathBuf,

        #[clap(flatten)]
        provider: ProviderArgs,

        #[clap(flatten)]
        secrets: SecretArgs,
    },

    /// Send a test request to each configured provider
    Validate { index: PathBuf },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    Hashing,
    Azure,
    Vertex,
    Openai,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ProviderArgs {
    /// YAML provider document (required for `multi`)
    #[clap(short, long, conflicts_with = "kind")]
    pub file: Option<PathBuf>,

    #[clap(short, long, value_enum, required_unless_present = "file")]
    pub kind: Option<ProviderKind>,

    /// Model name (local, vertex, openai)
    #[clap(short, long)]
    pub model: Option<String>,

    /// Resource or API endpoint (azure, vertex, openai)
    #[clap(long)]
    pub endpoint: Option<String>,

    /// Deployment name (azure)
    #[clap(long)]
    pub deployment: Option<String>,

    #[clap(long)]
    pub api_version: Option<String>,

    #[clap(long)]
    pub project_id: Option<String>,

    #[clap(long)]
    pub location: Option<String>,

    #[clap(long)]
    pub dimensions: Option<usize>,
}

#[derive(ClapArgs, Clone)]
pub struct SecretArgs {
    #[clap(long, env = "WAYFINDER_AZURE_API_KEY", hide_env_values = true)]
    pub azure_key: Option<String>,

    #[clap(long, env = "WAYFINDER_VERTEX_TOKEN", hide_env_values = true)]
    pub vertex_token: Option<String>,

    #[clap(long, env = "WAYFINDER_OPENAI_API_KEY", hide_env_values = true)]
    pub openai_key: Option<String>,
}

impl std::fmt::Debug for SecretArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SecretArgs {{ azure_key: {}, vertex_token: {}, openai_key: {} }}",
            redacted(&self.azure_key),
            redacted(&self.vertex_token),
            redacted(&self.openai_key)
        )
    }
}

fn redacted(secret: &Option<String>) -> &'static str {
    if secret.is_some() {
        "[REDACTED]"
    } else {
        "None"
    }
}
