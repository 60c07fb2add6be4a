use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use protocol::settings::{DEFAULT_FUND_ID, DEFAULT_MODEL};
use protocol::{AnalysisMethod, LlmProvider};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ocrd",
    version,
    about = "Upload prospectuses to the OCRD gateway and follow their analysis"
)]
pub(crate) struct Args {
    #[arg(long, env = "OCRD_GATEWAY_URL", default_value = "http://localhost:3000")]
    pub(crate) gateway: String,
    /// Threshold for the request log (debug, info, warn, error).
    #[arg(long, env = "OCRD_LOG_LEVEL", default_value = "info")]
    pub(crate) log_level: String,
    /// Append every request log entry to this JSON-lines file.
    #[arg(long, env = "OCRD_LOG_FILE")]
    pub(crate) log_file: Option<PathBuf>,
    /// Show request logging on stderr.
    #[arg(long, short)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Check the gateway, or the analysis backend behind it.
    Health {
        #[arg(long)]
        backend: bool,
    },
    /// List models offered by the backend.
    Models,
    /// Upload a PDF, start an analysis and follow it to the end.
    Run(RunArgs),
    Status {
        job_id: String,
    },
    Results {
        job_id: String,
    },
    Export {
        job_id: String,
        #[arg(long, value_enum)]
        format: ExportFormat,
        #[arg(long)]
        out: PathBuf,
    },
    /// List analysis traces, show one, or print one of its files.
    Traces {
        trace_id: Option<String>,
        #[arg(long, requires = "trace_id")]
        file: Option<String>,
    },
}

#[derive(ClapArgs, Debug)]
pub(crate) struct RunArgs {
    pub(crate) file: PathBuf,
    #[arg(long, value_enum, default_value_t = MethodArg::Llm)]
    pub(crate) method: MethodArg,
    #[arg(long, value_enum, default_value_t = ProviderArg::Openai)]
    pub(crate) provider: ProviderArg,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub(crate) model: String,
    #[arg(long, default_value = DEFAULT_FUND_ID)]
    pub(crate) fund_id: String,
    /// Follow progress over the WebSocket relay instead of polling.
    #[arg(long)]
    pub(crate) live: bool,
    /// Start the analysis without checking the model against the backend list.
    #[arg(long)]
    pub(crate) skip_model_check: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExportFormat {
    Excel,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MethodArg {
    Keywords,
    Llm,
    LlmWithFallback,
}

impl From<MethodArg> for AnalysisMethod {
    fn from(value: MethodArg) -> Self {
        match value {
            MethodArg::Keywords => AnalysisMethod::Keywords,
            MethodArg::Llm => AnalysisMethod::Llm,
            MethodArg::LlmWithFallback => AnalysisMethod::LlmWithFallback,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProviderArg {
    Openai,
    Ollama,
}

impl From<ProviderArg> for LlmProvider {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Openai => LlmProvider::Openai,
            ProviderArg::Ollama => LlmProvider::Ollama,
        }
    }
}
