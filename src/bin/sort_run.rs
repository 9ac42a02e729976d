// src/bin/sort_run.rs

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use staged_exec::prelude::*;

#[derive(Debug, Parser)]
#[clap(name = "sort_run", about = "Scan and externally sort shuffled integer tuples")]
struct Opts {
    #[clap(short = 'n', long = "num-tuples", default_value = "1000000")]
    num_tuples: u64,

    #[clap(short = 'p', long = "pages-per-run", default_value = "64")]
    pages_per_run: usize,

    #[clap(short = 'f', long = "merge-factor", default_value = "8")]
    merge_factor: usize,

    #[clap(short = 'w', long = "workers-per-stage", default_value = "2")]
    workers_per_stage: usize,
}

struct IntExtract;

impl KeyExtractor for IntExtract {
    fn extract_hint(&self, tuple: &[u8]) -> i64 {
        u64::from_le_bytes(tuple[..8].try_into().unwrap()) as i64
    }

    fn clone_box(&self) -> Box<dyn KeyExtractor> {
        Box::new(IntExtract)
    }
}

struct IntCompare;

impl KeyCompare for IntCompare {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a = u64::from_le_bytes(a[..8].try_into().unwrap());
        let b = u64::from_le_bytes(b[..8].try_into().unwrap());
        a.cmp(&b)
    }

    fn clone_box(&self) -> Box<dyn KeyCompare> {
        Box::new(IntCompare)
    }
}

fn shuffled_tuples(n: u64) -> Vec<u8> {
    let mut values: Vec<u64> = (0..n).collect();
    let mut state = 0x9e3779b97f4a7c15u64;
    for i in (1..values.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        values.swap(i, (state % (i as u64 + 1)) as usize);
    }
    let mut data = Vec::with_capacity(values.len() * 8);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    data
}

fn main() -> Result<(), ExecError> {
    let opts = Opts::parse();

    let config = EngineConfig {
        workers_per_stage: opts.workers_per_stage,
        scan_workers: opts.merge_factor.max(8),
    };
    let engine = EngineBuilder::new()
        .config(config)
        .policy(Arc::new(QueryCpuPolicy::new(CpuSet::discover())))
        .with_builtin_stages()
        .build();

    println!("generating {} tuples", opts.num_tuples);
    let data = shuffled_tuples(opts.num_tuples);

    let query_state = engine.new_query();
    let (scan_w, scan_r) = pair(8);
    let mut scan = TScanPacket::new(
        "sort_run-scan",
        scan_w,
        Box::new(TrivialFilter::new(8)),
        Box::new(VecSource::new("sort_run", 8, data)),
        false,
    );
    scan.core_mut().assign_query_state(query_state);

    let (out_w, mut out_r) = pair(8);
    let mut sort = SortPacket::new(
        "sort_run-sort",
        out_w,
        Box::new(TrivialFilter::new(8)),
        Box::new(IntExtract),
        Box::new(IntCompare),
        Box::new(scan),
        scan_r,
        SortParams {
            pages_per_run: opts.pages_per_run,
            merge_factor: opts.merge_factor,
            temp_root: None,
        },
    );
    sort.core_mut().assign_query_state(query_state);

    let start = Instant::now();
    engine.dispatch(Box::new(sort))?;

    let mut count = 0u64;
    let mut previous = 0u64;
    loop {
        match out_r.get_tuple() {
            Ok(Some(tuple)) => {
                let value = u64::from_le_bytes(tuple[..8].try_into().unwrap());
                if count > 0 && value < previous {
                    eprintln!("output out of order at tuple {}", count);
                    std::process::exit(1);
                }
                previous = value;
                count += 1;
            }
            Ok(None) => break,
            Err(_) => return Err(ExecError::Aborted),
        }
    }
    let elapsed = start.elapsed();

    println!(
        "sorted {} tuples in {:.3}s ({:.0} tuples/s)",
        count,
        elapsed.as_secs_f64(),
        count as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}
