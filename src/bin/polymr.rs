use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use polymr::builder::{self, BuildConfig};
use polymr::record::{self, ReaderSpec};
use polymr::{BackendRegistry, Featurizer, Index, ParallelIndex, SearchOptions};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an index from a record stream
    Index(IndexArgs),
    /// Query an index
    Query(QueryArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReaderKind {
    Csv,
    Psv,
}

#[derive(Parser, Debug)]
struct IndexArgs {
    /// URL for the storage backend, e.g. `disk://localhost/path/to/db'
    #[clap(short, long, value_parser)]
    backend: String,

    /// The path of the input file. Defaults to stdin
    #[clap(short, long, value_parser)]
    input: Option<PathBuf>,

    /// Input record format
    #[clap(long, value_enum, default_value_t = ReaderKind::Csv)]
    reader: ReaderKind,

    /// Number of concurrent workers
    #[clap(short = 'n', long, value_parser)]
    #[arg(default_value_t = 1)]
    parallel: usize,

    /// Column index of the primary key; negative counts from the end.
    /// Defaults to the last column
    #[clap(long, value_parser, allow_hyphen_values = true)]
    primary_key: Option<isize>,

    /// Comma-separated column indexes to search. Defaults to every
    /// column but the primary key
    #[clap(long, value_delimiter = ',')]
    search_idxs: Option<Vec<usize>>,

    /// Number of records for each worker to process in memory
    #[clap(long, value_parser)]
    #[arg(default_value_t = 50_000)]
    chunksize: usize,

    /// Where spill files go. Defaults to the system temp dir
    #[clap(long, value_parser)]
    tmpdir: Option<PathBuf>,

    /// Featurizer name: k2, k3, k4, compress, compress_k4
    #[clap(short, long, value_parser)]
    #[arg(default_value = "compress")]
    featurizer: String,
}

#[derive(Parser, Debug)]
struct QueryArgs {
    /// The query terms, one per searched field
    #[clap(value_parser, num_args = 1.., required = true)]
    term: Vec<String>,

    /// URL for the storage backend, e.g. `disk://localhost/path/to/db'
    #[clap(short, long, value_parser)]
    backend: String,

    /// The number of record votes to tally
    #[clap(short = 'r', long, value_parser)]
    #[arg(default_value_t = 100_000)]
    seeds: u64,

    /// The number of seed records to search through for best matches
    #[clap(short = 'n', long, value_parser)]
    #[arg(default_value_t = 600)]
    search_space: usize,

    /// The number of search results to return
    #[clap(short, long, value_parser)]
    #[arg(default_value_t = 5)]
    limit: usize,

    /// Run the query through a pool of this many workers
    #[clap(short = 'w', long, value_parser)]
    parallel: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Index(args) => build_index(args),
        Command::Query(args) => run_query(args),
    }
}

fn build_index(args: IndexArgs) -> anyhow::Result<()> {
    let registry = BackendRegistry::with_defaults();
    let mut backend = registry.open(&args.backend)?;
    let featurizer = Featurizer::from_name(&args.featurizer)?;

    let spec = ReaderSpec {
        search_idxs: args.search_idxs,
        pk_idx: args.primary_key,
        include_data: true,
    };
    let mut config = BuildConfig::default()
        .workers(args.parallel)
        .chunk_size(args.chunksize)
        .featurizer(featurizer);
    if let Some(tmpdir) = args.tmpdir {
        config = config.tmpdir(tmpdir);
    }

    let input: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(File::open(path)?),
        None => Box::new(io::stdin()),
    };
    match args.reader {
        ReaderKind::Csv => builder::build(
            record::from_csv(input, spec),
            backend.as_mut(),
            &config,
        )?,
        ReaderKind::Psv => builder::build(
            record::from_psv(BufReader::new(input), spec),
            backend.as_mut(),
            &config,
        )?,
    }
    backend.close()?;
    Ok(())
}

fn run_query(args: QueryArgs) -> anyhow::Result<()> {
    let registry = BackendRegistry::with_defaults();
    let opts = SearchOptions::default()
        .limit(args.limit)
        .seeds(args.seeds)
        .search_space(args.search_space);

    let hits = match args.parallel {
        Some(workers) => {
            let index = ParallelIndex::open(&args.backend, workers, &registry)?;
            let hits = index.search(&args.term, &opts)?;
            index.close()?;
            hits
        }
        None => {
            let index = Index::open(registry.open(&args.backend)?)?;
            let hits = index.search(&args.term, &opts)?;
            index.close()?;
            hits
        }
    };
    println!("{}", serde_json::to_string_pretty(&hits)?);
    Ok(())
}
