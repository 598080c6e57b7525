use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hysortk_lib::constants::{
    DEFAULT_KMER_SIZE, DEFAULT_MINIMIZER_SIZE, DEFAULT_THREADS_PER_WORKER, HISTOGRAM_MAX_COUNT,
    LOWER_KMER_FREQ, MAX_SEND_BATCH, MAX_SUPERMER_LEN, UNBALANCED_RATIO, UPPER_KMER_FREQ,
};
use hysortk_lib::{
    dispatch_on_k, kmer_histogram, Communicator, CountConfig, CountError, CountStats, DnaBuffer,
    Kmer, KmerBits, KmerCounter, LocalCommunicator, LocalGroup, ReadSource, SortPolicy,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "hysortk")]
#[command(version = "0.1.0")]
#[command(about = "HySortK: distributed k-mer counting", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count k-mers and write `kmer<TAB>count` lines
    Count {
        #[command(flatten)]
        run: RunArgs,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Count k-mers and write the `count<TAB>distinct k-mers` histogram
    Histogram {
        #[command(flatten)]
        run: RunArgs,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Input FASTA/FASTQ file (may be gzipped)
    #[arg(short, long)]
    input: String,

    /// K-mer length
    #[arg(short, long, default_value_t = DEFAULT_KMER_SIZE)]
    k: usize,

    /// Minimizer length
    #[arg(short, long, default_value_t = DEFAULT_MINIMIZER_SIZE)]
    m: usize,

    /// Number of simulated processes
    #[arg(short = 'p', long, default_value_t = 1)]
    ranks: usize,

    /// Threads per process (0 = all available cores)
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Threads per sort worker
    #[arg(long, default_value_t = DEFAULT_THREADS_PER_WORKER)]
    threads_per_worker: usize,

    /// Smallest count to keep
    #[arg(long, default_value_t = LOWER_KMER_FREQ)]
    lower: u32,

    /// Largest count to keep
    #[arg(long, default_value_t = UPPER_KMER_FREQ)]
    upper: u32,

    /// Keep every count
    #[arg(long)]
    no_filter: bool,

    /// Longest supermer in bases
    #[arg(long, default_value_t = MAX_SUPERMER_LEN)]
    max_supermer_len: usize,

    /// Bytes sent per exchange round
    #[arg(long, default_value_t = MAX_SEND_BATCH)]
    batch_bytes: usize,

    /// Sort strategy
    #[arg(long, value_enum, default_value_t = SortArg::Auto)]
    sort: SortArg,

    /// Tasks above this multiple of the mean size are pre-aggregated
    #[arg(long, default_value_t = UNBALANCED_RATIO)]
    unbalanced_ratio: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SortArg {
    Auto,
    InPlace,
    Aligned,
}

impl From<SortArg> for SortPolicy {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Auto => SortPolicy::Auto,
            SortArg::InPlace => SortPolicy::InPlace,
            SortArg::Aligned => SortPolicy::Aligned,
        }
    }
}

impl RunArgs {
    fn config(&self) -> anyhow::Result<CountConfig> {
        let config = CountConfig {
            k: self.k,
            m: self.m,
            num_threads: self.threads,
            threads_per_worker: self.threads_per_worker,
            lower_freq: self.lower,
            upper_freq: self.upper,
            filter: !self.no_filter,
            max_supermer_len: self.max_supermer_len,
            max_send_batch: self.batch_bytes,
            sort_policy: self.sort.into(),
            unbalanced_ratio: self.unbalanced_ratio,
            ..CountConfig::default()
        };
        config.validate().map_err(|e| anyhow!(e))?;
        Ok(config)
    }
}

/// What each rank hands back to the driver
struct RankReport {
    table: Vec<(String, u32)>,
    histogram: Vec<u64>,
    stats: CountStats,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Report {
    Table,
    Histogram,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing: use RUST_LOG if set, otherwise info (debug with --verbose)
    let fallback = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Count { run, output } => {
            let reports = run_ranks(&run, Report::Table)?;
            write_table(&reports, output.as_deref())?;
        }
        Commands::Histogram { run, output } => {
            let reports = run_ranks(&run, Report::Histogram)?;
            write_histogram(&reports, output.as_deref())?;
        }
    }

    Ok(())
}

/// Load the input, split it across simulated ranks and count
fn run_ranks(args: &RunArgs, report: Report) -> anyhow::Result<Vec<RankReport>> {
    if args.ranks == 0 {
        return Err(anyhow!("at least one rank is required"));
    }
    let config = args.config()?;

    info!("Counting k-mers with HySortK...");
    info!("  Input: {}", args.input);
    info!("  k: {}, m: {}", config.k, config.m);
    info!("  Ranks: {}", args.ranks);

    let start = Instant::now();
    let reads = DnaBuffer::from_fastx(&args.input)?;
    info!(
        "  Loaded {} reads ({} bases) in {:.3}s",
        reads.count(),
        reads.total_bases(),
        start.elapsed().as_secs_f64()
    );
    let parts = reads.partition(args.ranks);

    let start = Instant::now();
    let k = config.k;
    let results = LocalGroup::run(args.ranks, |comm| {
        dispatch_on_k!(k, K => count_rank::<K>(comm, &config, &parts[comm.rank()], report))
    });

    let mut reports = Vec::with_capacity(results.len());
    for (rank, result) in results.into_iter().enumerate() {
        let report = result.with_context(|| format!("rank {rank} failed"))?;
        debug!("Rank {} stats: {:?}", rank, report.stats);
        reports.push(report);
    }

    let distinct: usize = reports.iter().map(|r| r.table.len()).sum();
    let skipped: usize = reports.iter().map(|r| r.stats.reads_skipped).sum();
    info!("Counting took {:.3}s", start.elapsed().as_secs_f64());
    if report == Report::Table {
        info!("  {} distinct k-mers kept, {} short reads skipped", distinct, skipped);
    }
    Ok(reports)
}

fn count_rank<const K: usize>(
    comm: &LocalCommunicator,
    config: &CountConfig,
    reads: &DnaBuffer,
    report: Report,
) -> Result<RankReport, CountError>
where
    Kmer<K>: KmerBits,
{
    let counter = KmerCounter::new(comm, config.clone())?;
    let output = counter.count::<K, _>(reads)?;

    let (table, histogram) = match report {
        Report::Table => (
            output.kmers.iter().map(|e| (e.kmer.to_string(), e.count)).collect(),
            Vec::new(),
        ),
        Report::Histogram => {
            let max_count = config.band().upper.min(HISTOGRAM_MAX_COUNT);
            (Vec::new(), kmer_histogram(&output.kmers, max_count, comm)?)
        }
    };
    Ok(RankReport { table, histogram, stats: output.stats })
}

fn open_output(path: Option<&str>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create output file: {path}"))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    })
}

fn write_table(reports: &[RankReport], path: Option<&str>) -> anyhow::Result<()> {
    let mut out = open_output(path)?;
    for report in reports {
        for (kmer, count) in &report.table {
            writeln!(out, "{kmer}\t{count}")?;
        }
    }
    out.flush().context("Failed to flush k-mer table")?;
    Ok(())
}

fn write_histogram(reports: &[RankReport], path: Option<&str>) -> anyhow::Result<()> {
    // every rank holds the same global histogram
    let Some(first) = reports.first() else {
        return Ok(());
    };
    let mut out = open_output(path)?;
    for (count, &kmers) in first.histogram.iter().enumerate().skip(1) {
        if kmers > 0 {
            writeln!(out, "{count}\t{kmers}")?;
        }
    }
    out.flush().context("Failed to flush histogram")?;
    Ok(())
}
