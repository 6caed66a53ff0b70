//! Build-time-generated tunables, parsed from `lfsmr.toml` by `build.rs`.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
