//! CLI command implementations.

pub mod run;

/// Parse and validate a configuration file. Returns the process exit code.
pub fn validate(path: &str) -> i32 {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path, e);
            return 2;
        }
    };

    match conveyor_config::parse_pipeline(&content) {
        Ok(pipeline) => {
            println!(
                "Configuration is valid: pipeline '{}', {} job(s), {} trigger(s)",
                pipeline.name,
                pipeline.jobs.len(),
                pipeline.triggers.len()
            );
            0
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            2
        }
    }
}
