use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct Config {
    lfht_min_table_size_log2: Option<u32>,
    epoch_tick_pace_mask: Option<u64>,
    pc_shift_threshold_cpus: Option<u32>,
    migrate_pace_double: Option<usize>,
    migrate_pace_default: Option<usize>,
}

struct Resolved {
    lfht_min_table_size_log2: u32,
    epoch_tick_pace_mask: u64,
    pc_shift_threshold_cpus: u32,
    migrate_pace_double: usize,
    migrate_pace_default: usize,
}

fn resolve(cfg: &Config) -> Resolved {
    let lfht_min_table_size_log2 = cfg.lfht_min_table_size_log2.unwrap_or(5);
    let epoch_tick_pace_mask = cfg.epoch_tick_pace_mask.unwrap_or(31);
    let pc_shift_threshold_cpus = cfg.pc_shift_threshold_cpus.unwrap_or(8);
    let migrate_pace_double = cfg.migrate_pace_double.unwrap_or(1);
    let migrate_pace_default = cfg.migrate_pace_default.unwrap_or(3);

    assert!(lfht_min_table_size_log2 >= 1, "lfht_min_table_size_log2 must be >= 1");
    assert!(
        (epoch_tick_pace_mask + 1).is_power_of_two(),
        "epoch_tick_pace_mask ({epoch_tick_pace_mask}) must be 2^n - 1"
    );
    assert!(migrate_pace_double > 0, "migrate_pace_double must be > 0");
    assert!(migrate_pace_default > 0, "migrate_pace_default must be > 0");

    Resolved {
        lfht_min_table_size_log2,
        epoch_tick_pace_mask,
        pc_shift_threshold_cpus,
        migrate_pace_double,
        migrate_pace_default,
    }
}

fn generate(cfg: &Resolved, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs from lfsmr.toml. Do not edit.\n\n\
         pub const LFHT_MIN_TABLE_SIZE_LOG2: u32 = {};\n\
         pub const EPOCH_TICK_PACE_MASK: u64 = {};\n\
         pub const PC_SHIFT_THRESHOLD_CPUS: u32 = {};\n\
         pub const MIGRATE_PACE_DOUBLE: usize = {};\n\
         pub const MIGRATE_PACE_DEFAULT: usize = {};\n",
        cfg.lfht_min_table_size_log2,
        cfg.epoch_tick_pace_mask,
        cfg.pc_shift_threshold_cpus,
        cfg.migrate_pace_double,
        cfg.migrate_pace_default,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let config_path = format!("{manifest_dir}/lfsmr.toml");
    println!("cargo:rerun-if-changed={config_path}");

    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {config_path}: {e}"));
    let config: Config = toml::from_str(&content).expect("failed to parse lfsmr.toml");
    let resolved = resolve(&config);

    let out_dir = env::var("OUT_DIR").unwrap();
    generate(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
