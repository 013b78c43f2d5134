use mau::{algo::{allocate_stages, StageAllocator}, *};
use anyhow::{bail, ensure};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Allocates synthetic stages and prints where everything went
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Table set to allocate
    #[arg(value_enum)]
    scenario:       Scenario,

    /// Number of stages, allocated in parallel
    #[arg(short = 'n', long, default_value_t = 1)]
    #[arg(value_parser = clap::value_parser!(usize))]
    stages:         usize,

    /// Seed for random table sets and hash seeds
    #[arg(short, long, default_value_t = 0)]
    #[arg(value_parser = clap::value_parser!(u64))]
    seed:           u64,

    /// Rows a resource may spill below its home row
    #[arg(short = 'o', long, default_value_t = MAX_OVERFLOW_ROWS)]
    #[arg(value_parser = clap::value_parser!(usize))]
    max_overflow:   usize,

    /// RAM columns the match region starts with
    #[arg(short = 'c', long, default_value_t = SRAM_COLUMNS)]
    #[arg(value_parser = clap::value_parser!(usize))]
    match_columns:  usize,

    /// Give every table a hash function of its own
    #[arg(long)]
    no_sharing:     bool,

    /// Print the RAM and crossbar occupancy maps
    #[arg(short, long)]
    maps:           bool,

    /// Exit with an error if any stage fails
    #[arg(long)]
    strict:         bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Scenario {
    /// One exact table with a 32-bit key
    Single,
    /// One table of every kind, with attached resources
    Mixed,
    /// A big exact table and a counter that only fit after a retry
    Pressure,
    /// More RAMs than the stage has
    Overfull,
    /// Random tables
    Random,
}

const FIELDS: usize = 24;

fn field(i: usize) -> String {
    format!("f{i}")
}

/// Fields `f0..f24` in containers of 8, 16 and 32 bits.
fn phv() -> IndexMap<String, ContainerSlot> {
    (0..FIELDS)
        .map(|i| {
            let width = [32, 16, 8][i % 3];
            (field(i), ContainerSlot::new(&format!("C{i}"), width, 0))
        })
        .collect()
}

fn key(fields: &[usize]) -> Vec<KeyField> {
    fields.iter().map(|i| KeyField::exact(&field(*i), [32, 16, 8][i % 3])).collect()
}

fn mixed() -> Vec<TableRequest> {
    vec![
        TableRequest::exact("fwd", key(&[0, 1]), 8 * 1024)
            .with_ways(2)
            .with_gateway(key(&[2]))
            .attach(AttachedResource::new("fwd_cnt", AttachedKind::Counter { per_word: 1 }, 8 * 1024))
            .attach(AttachedResource::new("fwd_ad", AttachedKind::ActionData { width: 64 }, 8 * 1024))
            .attach(AttachedResource::new("fwd_idle", AttachedKind::IdleTime { precision: 3 }, 8 * 1024)),
        TableRequest::ternary("acl", vec![
            KeyField::exact(&field(3), 32),
            KeyField::range(&field(4), 16),
            KeyField::slice(&field(5), 0, 3),
        ], 2048).with_tind(2)
            .attach(AttachedResource::new("acl_meter", AttachedKind::Meter { color_maps: true }, 2048)),
        TableRequest::atcam("lpm", key(&[6, 7]), 4 * 1024, 4),
        TableRequest::dleft("learn", key(&[12, 13]), 3 * 1024, 3),
        TableRequest::new("ecmp", MatchKind::HashAction, key(&[6, 9]), 1024)
            .attach(AttachedResource::new("ecmp_sel", AttachedKind::Selector, 4 * 1024).hash_addressed())
            .attach(AttachedResource::new("ecmp_ad", AttachedKind::ActionData { width: 32 }, 1024)),
        TableRequest::new("cond", MatchKind::NoMatch, vec![], 0).with_gateway(key(&[10])),
    ]
}

fn pressure(depth: u64) -> Vec<TableRequest> {
    vec![
        TableRequest::exact("big", key(&[0]), depth * 1024)
            .attach(AttachedResource::new("big_cnt", AttachedKind::Counter { per_word: 1 }, 12 * 1024)),
    ]
}

fn random(rng: &mut StdRng) -> Vec<TableRequest> {
    let tables = rng.gen_range(2..8);
    (0..tables)
        .map(|t| {
            let fields = (0..rng.gen_range(1..4)).map(|_| rng.gen_range(0..FIELDS)).unique().collect_vec();
            let entries = 512 * rng.gen_range(1..9);
            let name = format!("t{t}");
            let mut req = match rng.gen_range(0..4) {
                0       => TableRequest::ternary(&name, key(&fields), entries).with_tind(2),
                1       => TableRequest::new(&name, MatchKind::HashAction, key(&fields), entries),
                _       => TableRequest::exact(&name, key(&fields), entries).with_ways(rng.gen_range(1..3)),
            };
            if rng.gen_bool(0.5) {
                let kind = match rng.gen_range(0..3) {
                    0   => AttachedKind::Counter { per_word: 1 },
                    1   => AttachedKind::Meter { color_maps: rng.gen_bool(0.5) },
                    _   => AttachedKind::ActionData { width: 32 },
                };
                req = req.attach(AttachedResource::new(&format!("{name}_{}", kind.short_name()), kind, entries));
            }
            req
        })
        .collect()
}

fn scenario(s: Scenario, stage: usize, seed: u64) -> Vec<TableRequest> {
    match s {
        Scenario::Single    => vec![TableRequest::exact("fwd", key(&[0]), 1024)],
        Scenario::Mixed     => mixed(),
        Scenario::Pressure  => pressure(60),
        Scenario::Overfull  => pressure(75),
        Scenario::Random    => random(&mut StdRng::seed_from_u64(seed.wrapping_add(stage as u64))),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Args::parse();
    ensure!(cli.stages > 0, "At least one stage is needed");
    ensure!((1..=SRAM_COLUMNS).contains(&cli.match_columns), "Match columns must be in 1..={SRAM_COLUMNS}");
    ensure!(cli.max_overflow <= MAX_OVERFLOW_ROWS, "Overflow can't reach past {MAX_OVERFLOW_ROWS} rows");
    let options = AllocOptions {
        max_overflow_rows:      cli.max_overflow,
        initial_match_columns:  cli.match_columns,
        hash_seed:              cli.seed,
        allow_sharing:          !cli.no_sharing,
    };
    let phv = phv();
    let stages = (0..cli.stages).map(|i| scenario(cli.scenario, i, cli.seed)).collect_vec();

    let total_start = Instant::now();
    let results = if cli.maps {
        // Sequential, to keep every allocator around for printing.
        stages.iter()
            .enumerate()
            .map(|(i, reqs)| {
                let mut sa = StageAllocator::new(i, options.clone());
                let res = sa.allocate(reqs, &phv);
                if res.is_ok() {
                    println!("{}{}", sa.ixbar(), sa.memories());
                }
                res
            })
            .collect_vec()
    } else {
        allocate_stages(&stages, &phv, &options)
    };

    let mut failed = 0;
    for (i, res) in results.iter().enumerate() {
        match res {
            Ok(alloc)   => print!("{alloc}"),
            Err(e)      => {
                failed += 1;
                println!("stage {i}: does not fit: {e}");
            },
        }
    }
    println!("Total allocation time: {} μs", total_start.elapsed().as_micros());

    if cli.strict && failed > 0 {
        bail!("{failed} of {} stages failed", results.len());
    }

    Ok(())
}
