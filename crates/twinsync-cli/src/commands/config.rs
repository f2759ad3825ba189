//! `twinsync config`: print or write the effective configuration.

pub fn run(path: Option<&str>, output: Option<&str>) {
    let config = super::load_config(path);
    let text = config.to_json_pretty().unwrap_or_else(|e| super::fail(e));
    match output {
        Some(out) => {
            if let Err(e) = std::fs::write(out, format!("{text}\n")) {
                super::fail(format!("writing {out}: {e}"));
            }
            println!("Configuration written to {out}");
        }
        None => println!("{text}"),
    }
}
