use std::{env, fs, path::PathBuf};

fn main() {
    let mut features: Vec<String> = env::vars()
        .filter_map(|(key, _)| {
            key.strip_prefix("CARGO_FEATURE_")
                .map(|feature| feature.to_lowercase().replace('_', "-"))
        })
        .collect();
    features.sort();

    let feature_code = format!(
        "const ENABLED_FEATURES: [&str; {}] = {:?};",
        features.len(),
        features
    );

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("cargo sets OUT_DIR"));
    fs::write(out_dir.join("features.rs"), feature_code).expect("unable to write features.rs");

    println!("cargo:rerun-if-changed=build.rs");
}
