use crate::MemSampler;
use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, Command};
use csv::Writer;
use rand::distributions::{Uniform, WeightedIndex};
use simplelog::LevelFilter;
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::Path;
use std::time::Duration;

pub enum OpsPerCs {
    One,
    Four,
}

impl fmt::Display for OpsPerCs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpsPerCs::One => write!(f, "1"),
            OpsPerCs::Four => write!(f, "4"),
        }
    }
}

#[derive(PartialEq, Debug)]
pub enum Op {
    Contains,
    Insert,
    Remove,
}

impl Op {
    pub const OPS: [Op; 3] = [Op::Contains, Op::Insert, Op::Remove];
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum GetRate {
    WriteOnly = 0,
    ReadWrite = 1,
    ReadIntensive = 2,
    ReadOnly = 3,
}

impl GetRate {
    /// Weights of [`Op::OPS`].
    pub fn op_weights(self) -> [i32; 3] {
        match self {
            GetRate::WriteOnly => [0, 1, 1],
            GetRate::ReadWrite => [2, 1, 1],
            GetRate::ReadIntensive => [18, 1, 1],
            GetRate::ReadOnly => [1, 0, 0],
        }
    }
}

pub struct Config {
    pub mm: String,
    pub threads: usize,

    pub aux_thread: usize,
    pub aux_thread_period: Duration,
    pub sampling: bool,
    pub sampling_period: Duration,

    pub get_rate: GetRate,
    pub op_dist: WeightedIndex<i32>,
    pub key_dist: Uniform<i32>,
    pub prefill: usize,
    pub key_range: i32,
    pub interval: u64,
    pub duration: Duration,
    pub ops_per_cs: OpsPerCs,
    pub log_level: LevelFilter,

    pub mem_sampler: MemSampler,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bst ({}): {} threads, r{}, c{}, g{}",
            self.mm,
            self.threads,
            self.key_range,
            self.ops_per_cs,
            self.get_rate as u8,
        )
    }
}

pub struct BenchWriter {
    output: Option<Writer<File>>,
}

#[derive(Clone)]
pub struct Perf {
    pub ops_per_sec: u64,
    pub peak_mem: usize,
    pub avg_mem: usize,
    /// Number of keys left in the tree after the run.
    pub size: usize,
    pub key_sum: i64,
}

impl fmt::Display for Perf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops/s: {}, peak mem: {}, avg_mem: {}, size: {}, key sum: {}",
            self.ops_per_sec,
            readable_bytes(self.peak_mem),
            readable_bytes(self.avg_mem),
            self.size,
            self.key_sum
        )
    }
}

fn readable_bytes(num: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    for (i, unit) in UNITS.iter().enumerate() {
        if num / 2usize.pow(i as u32 * 10) < 1000 {
            return format!("{:.3} {}", num as f64 / 2f64.powf(i as f64 * 10.0), unit);
        }
    }
    format!(
        "{:.3} {}",
        num as f64 / 2f64.powf((UNITS.len() - 1) as f64 * 10.0),
        UNITS[UNITS.len() - 1]
    )
}

const HEADER: [&str; 13] = [
    "ds",
    "mm",
    "threads",
    "sampling_period",
    "get_rate",
    "ops_per_cs",
    "throughput",
    "peak_mem",
    "avg_mem",
    "size",
    "key_sum",
    "key_range",
    "interval",
];

impl BenchWriter {
    pub fn write_record(self, config: &Config, perf: &Perf) -> anyhow::Result<()> {
        if let Some(mut output) = self.output {
            output.write_record(&[
                "bst".to_string(),
                config.mm.clone(),
                config.threads.to_string(),
                config.sampling_period.as_millis().to_string(),
                (config.get_rate as u8).to_string(),
                config.ops_per_cs.to_string(),
                perf.ops_per_sec.to_string(),
                perf.peak_mem.to_string(),
                perf.avg_mem.to_string(),
                perf.size.to_string(),
                perf.key_sum.to_string(),
                config.key_range.to_string(),
                config.interval.to_string(),
            ])?;
            output.flush()?;
        }
        Ok(())
    }
}

/// Opens `path` for appending, writing the header first if the file is new.
fn open_output(path: &Path) -> anyhow::Result<Writer<File>> {
    if let Some(dir) = path.parent() {
        create_dir_all(dir)
            .with_context(|| format!("cannot create output directory {}", dir.display()))?;
    }
    if let Ok(f) = OpenOptions::new().read(true).append(true).open(path) {
        return Ok(csv::Writer::from_writer(f));
    }
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("cannot create output file {}", path.display()))?;
    let mut output = csv::Writer::from_writer(f);
    output.write_record(HEADER)?;
    output.flush()?;
    Ok(output)
}

fn command(mm: &str) -> Command {
    Command::new(mm.to_string())
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Numbers of threads to run."),
        )
        .arg(
            Arg::new("get rate")
                .short('g')
                .help(
                    "The proportion of `contains`(read) operations. \
                     0: 0%, 1: 50%, 2: 90%, 3: 100%",
                )
                .value_parser(value_parser!(u8).range(0..4))
                .default_value("0"),
        )
        .arg(
            Arg::new("range")
                .short('r')
                .value_parser(value_parser!(i32).range(1..))
                .help("Key range: [0..RANGE]")
                .default_value("100000"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64).range(1..))
                .help("Time interval in seconds to run the benchmark")
                .default_value("10"),
        )
        .arg(
            Arg::new("sampling period")
                .short('s')
                .value_parser(value_parser!(u64))
                .help(
                    "The period to query jemalloc stats.allocated (ms). 0 for no sampling. \
                     Only supported on linux.",
                )
                .default_value("1"),
        )
        .arg(
            Arg::new("ops per cs")
                .short('c')
                .value_parser(["1", "4"])
                .help("Operations per each critical section")
                .default_value("1"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .help("Output CSV filename. Appends the data if the file already exists."),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Log more (-v: info, -vv: debug, -vvv: trace)"),
        )
        .arg(
            Arg::new("dry run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Check whether the arguments are parsable, without running a benchmark"),
        )
}

/// Parses the process arguments. Returns `None` for a dry run.
pub fn setup(mm: String) -> anyhow::Result<Option<(Config, BenchWriter)>> {
    let m = command(&mm).get_matches();

    let threads = *m.get_one::<usize>("threads").context("missing thread count")?;
    let get_rate = match *m.get_one::<u8>("get rate").context("missing get rate")? {
        0 => GetRate::WriteOnly,
        1 => GetRate::ReadWrite,
        2 => GetRate::ReadIntensive,
        3 => GetRate::ReadOnly,
        _ => unreachable!("get_rate is invalid"),
    };
    let key_range = *m.get_one::<i32>("range").context("missing key range")?;
    let prefill = key_range as usize / 2;
    let key_dist = Uniform::from(0..key_range);
    let interval = *m.get_one::<u64>("interval").context("missing interval")?;
    let sampling_period = *m
        .get_one::<u64>("sampling period")
        .context("missing sampling period")?;
    let sampling = sampling_period > 0 && cfg!(target_os = "linux");
    let ops_per_cs = match m.get_one::<String>("ops per cs").map(String::as_str) {
        Some("4") => OpsPerCs::Four,
        _ => OpsPerCs::One,
    };
    let log_level = match m.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let duration = Duration::from_secs(interval);
    let op_dist = WeightedIndex::new(get_rate.op_weights())?;

    if m.get_flag("dry run") {
        return Ok(None);
    }

    let output = m
        .get_one::<String>("output")
        .map(|name| open_output(Path::new(name)))
        .transpose()?;
    let mem_sampler = MemSampler::new()?;
    let config = Config {
        mm,
        threads,

        aux_thread: if sampling { 1 } else { 0 },
        aux_thread_period: Duration::from_millis(1),
        sampling,
        sampling_period: Duration::from_millis(sampling_period),

        get_rate,
        op_dist,
        key_dist,
        prefill,
        key_range,
        interval,
        duration,
        ops_per_cs,
        log_level,

        mem_sampler,
    };

    Ok(Some((config, BenchWriter { output })))
}

#[cfg(test)]
mod tests {
    use super::{command, readable_bytes, GetRate};

    #[test]
    fn arguments_parse() {
        let m = command("ebr")
            .try_get_matches_from(["ebr", "-t", "4", "-g", "2", "-r", "1000", "-vv"])
            .unwrap();
        assert_eq!(m.get_one::<usize>("threads"), Some(&4));
        assert_eq!(m.get_one::<u8>("get rate"), Some(&2));
        assert_eq!(m.get_one::<i32>("range"), Some(&1000));
        assert_eq!(m.get_count("verbose"), 2);
        assert!(!m.get_flag("dry run"));
    }

    #[test]
    fn threads_are_required() {
        assert!(command("ebr").try_get_matches_from(["ebr"]).is_err());
        assert!(command("ebr")
            .try_get_matches_from(["ebr", "-t", "1", "-g", "4"])
            .is_err());
        assert!(command("ebr")
            .try_get_matches_from(["ebr", "-t", "1", "-r", "0"])
            .is_err());
    }

    #[test]
    fn read_only_never_writes() {
        assert_eq!(GetRate::ReadOnly.op_weights(), [1, 0, 0]);
        assert_eq!(GetRate::WriteOnly.op_weights()[0], 0);
    }

    #[test]
    fn bytes_are_readable() {
        assert_eq!(readable_bytes(512), "512.000 B");
        assert_eq!(readable_bytes(2048), "2.000 KiB");
    }
}
