// src/bin/shared_scan.rs
//
// Submits N identical scan+count queries flagged mergeable and lets the
// engine share one underlying scan execution across all of them.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use staged_exec::prelude::*;

#[derive(Debug, Parser)]
#[clap(name = "shared_scan", about = "Demonstrate work sharing across identical queries")]
struct Opts {
    #[clap(short = 'n', long = "num-tuples", default_value = "1000000")]
    num_tuples: u64,

    #[clap(short = 'q', long = "num-queries", default_value = "4")]
    num_queries: usize,
}

struct CountAggregate;

impl TupleAggregate for CountAggregate {
    fn key_size(&self) -> usize {
        0
    }

    fn key<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
        &tuple[..0]
    }

    fn state_size(&self) -> usize {
        8
    }

    fn output_size(&self) -> usize {
        8
    }

    fn init(&self, state: &mut [u8]) {
        state.fill(0);
    }

    fn accumulate(&self, state: &mut [u8], _tuple: &[u8]) {
        let count = u64::from_le_bytes(state[..8].try_into().unwrap());
        state[..8].copy_from_slice(&(count + 1).to_le_bytes());
    }

    fn finish(&self, dst: &mut [u8], state: &[u8], _key: &[u8]) {
        dst.copy_from_slice(&state[..8]);
    }

    fn signature(&self) -> String {
        "count".to_string()
    }

    fn clone_box(&self) -> Box<dyn TupleAggregate> {
        Box::new(CountAggregate)
    }
}

fn main() -> Result<(), ExecError> {
    let opts = Opts::parse();

    let engine = EngineBuilder::new()
        .policy(Arc::new(RrCpuPolicy::new(CpuSet::discover())))
        .with_builtin_stages()
        .build();

    let mut data = Vec::with_capacity(opts.num_tuples as usize * 8);
    for v in 0..opts.num_tuples {
        data.extend_from_slice(&v.to_le_bytes());
    }

    let start = Instant::now();
    let mut outputs = Vec::new();
    for q in 0..opts.num_queries {
        let query_state = engine.new_query();
        let (scan_w, scan_r) = pair(8);
        let mut scan = TScanPacket::new(
            format!("shared_scan-{}-scan", q),
            scan_w,
            Box::new(TrivialFilter::new(8)),
            Box::new(VecSource::new("shared_scan", 8, data.clone())),
            true,
        );
        scan.core_mut().assign_query_state(query_state);

        let (out_w, out_r) = pair(8);
        let mut agg = AggregatePacket::new(
            format!("shared_scan-{}-count", q),
            out_w,
            Box::new(TrivialFilter::new(8)),
            Box::new(CountAggregate),
            Box::new(scan),
            scan_r,
            true,
        );
        agg.core_mut().assign_query_state(query_state);
        engine.dispatch(Box::new(agg))?;
        outputs.push(out_r);
    }

    for (q, mut out_r) in outputs.into_iter().enumerate() {
        loop {
            match out_r.get_tuple() {
                Ok(Some(tuple)) => {
                    let count = u64::from_le_bytes(tuple[..8].try_into().unwrap());
                    println!("query {}: count = {}", q, count);
                }
                Ok(None) => break,
                Err(_) => return Err(ExecError::Aborted),
            }
        }
    }
    println!("{} queries in {:.3}s", opts.num_queries, start.elapsed().as_secs_f64());
    Ok(())
}
