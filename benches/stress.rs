use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;

use officeno::engine::Engine;
use officeno::fiscal::FiscalPeriod;
use officeno::keycodec::OfficeKey;
use officeno::location::LocationRegistry;
use officeno::model::{Actor, CaseFields, Field, NewCase};
use officeno::notify::NotifyHub;

fn bench_engine(data_dir: &Path, name: &str) -> Arc<Engine> {
    let path = data_dir.join(name);
    let _ = std::fs::remove_file(&path);
    Arc::new(
        Engine::new(path, Arc::new(NotifyHub::new()), Arc::new(LocationRegistry::builtin()))
            .expect("engine open failed"),
    )
}

fn day(start: NaiveDate, offset: u64) -> NaiveDate {
    start + chrono::Days::new(offset)
}

fn new_case(branch: &str, visit: NaiveDate) -> NewCase {
    NewCase {
        location: branch.to_string(),
        fields: CaseFields {
            visit_date: Field::Value(visit),
            customer_name: Field::Value("Bench Customer".into()),
            bank_name: Field::Value("Bench Bank".into()),
            ..Default::default()
        },
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Every allocated key in `period` must carry a distinct number.
fn check_unique(engine: &Engine, period: FiscalPeriod) {
    let cases = engine.list_cases(period);
    let numbers: HashSet<u16> = cases
        .iter()
        .filter_map(|c| OfficeKey::decode(&c.key).ok())
        .map(|k| k.sequence.get())
        .collect();
    assert_eq!(numbers.len(), cases.len(), "duplicate sequence numbers in {period}");
    println!("  {} cases in {period}, all numbers distinct", cases.len());
}

async fn phase1_sequential(data_dir: &Path) {
    let engine = bench_engine(data_dir, "phase1.wal");
    let start_day = NaiveDate::from_ymd_opt(2020, 4, 1).expect("valid date");
    let n = 800;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        engine
            .create_case(&Actor::Admin, new_case("Pune", day(start_day, (i % 300) as u64)))
            .await
            .expect("create failed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} cases in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
    check_unique(&engine, FiscalPeriod::starting(2020));
}

async fn phase2_concurrent(data_dir: &Path) {
    let engine = bench_engine(data_dir, "phase2.wal");
    let start_day = NaiveDate::from_ymd_opt(2021, 4, 1).expect("valid date");
    let branches: Vec<String> = engine.registry.branches().map(str::to_string).collect();
    let n_days = 100;

    let start = Instant::now();
    let mut handles = Vec::new();
    for branch in &branches {
        let engine = engine.clone();
        let branch = branch.clone();
        handles.push(tokio::spawn(async move {
            let actor = Actor::Branch(branch.clone());
            let mut latencies = Vec::with_capacity(n_days);
            for d in 0..n_days {
                let t = Instant::now();
                // Two commits per slot: the second only re-saves.
                engine
                    .commit(&actor, day(start_day, d as u64), &branch)
                    .await
                    .expect("commit failed");
                engine
                    .commit(&actor, day(start_day, d as u64), &branch)
                    .await
                    .expect("re-commit failed");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.expect("task panicked"));
    }
    let elapsed = start.elapsed();
    let total = branches.len() * n_days;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {} branches x {n_days} slots = {total} commits in {:.2}s = {ops:.0} ops/sec",
        branches.len(),
        elapsed.as_secs_f64()
    );
    print_latency("commit pair latency", &mut latencies);
    check_unique(&engine, FiscalPeriod::starting(2021));
}

async fn phase3_read_under_load(data_dir: &Path) {
    let engine = bench_engine(data_dir, "phase3.wal");
    let period = FiscalPeriod::starting(2022);
    let start_day = NaiveDate::from_ymd_opt(2022, 4, 1).expect("valid date");

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 0..500u64 {
                let branch = if i % 2 == 0 { "Sangli" } else { "Kolhapur" };
                engine
                    .create_case(&Actor::Admin, new_case(branch, day(start_day, i % 200)))
                    .await
                    .expect("create failed");
            }
        })
    };

    let mut latencies = Vec::new();
    while !writer.is_finished() {
        let t = Instant::now();
        let _ = engine.next_free(period, &Default::default());
        let _ = engine.allocated_numbers(period);
        latencies.push(t.elapsed());
        tokio::task::yield_now().await;
    }
    writer.await.expect("writer panicked");

    print_latency("next_free + allocated_numbers", &mut latencies);
    check_unique(&engine, period);
}

async fn phase4_sweep_and_compact(data_dir: &Path) {
    let engine = bench_engine(data_dir, "phase4.wal");
    let start_day = NaiveDate::from_ymd_opt(2023, 4, 1).expect("valid date");
    let n_days = 60;

    // Half the branches commit by hand; the sweep picks up the rest.
    let branches: Vec<String> = engine.registry.branches().map(str::to_string).collect();
    for d in 0..n_days {
        for branch in branches.iter().step_by(2) {
            engine
                .commit(&Actor::Admin, day(start_day, d), branch)
                .await
                .expect("commit failed");
        }
    }

    let start = Instant::now();
    let mut finalized = 0;
    for d in 0..n_days {
        let date = day(start_day, d);
        let report = engine
            .finalize_day(date, day(start_day, n_days))
            .await
            .expect("sweep failed");
        assert!(report.failed.is_empty());
        finalized += report.finalized.len();
    }
    println!(
        "  swept {n_days} days: {finalized} slots finalized in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    check_unique(&engine, FiscalPeriod::starting(2023));

    let appends = engine.wal_appends_since_compact().await;
    let t = Instant::now();
    engine.compact_wal().await.expect("compaction failed");
    println!(
        "  compacted {appends} appends in {:.2}ms",
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    let data_dir = std::env::var("OFFICENO_BENCH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("officeno_bench"));
    std::fs::create_dir_all(&data_dir).expect("cannot create bench dir");

    println!("=== officeno stress benchmark ===");
    println!("data dir: {}\n", data_dir.display());

    println!("[phase 1] sequential direct creates");
    phase1_sequential(&data_dir).await;

    println!("\n[phase 2] concurrent reservation commits");
    phase2_concurrent(&data_dir).await;

    println!("\n[phase 3] allocation reads under write load");
    phase3_read_under_load(&data_dir).await;

    println!("\n[phase 4] daily sweep and compaction");
    phase4_sweep_and_compact(&data_dir).await;

    println!("\n=== benchmark complete ===");
}
