// =============================================================================
// VKCOMPUTE - Vulkan compute round trip
// =============================================================================
//
// FLOW:
// 1. Load config.toml, set up logging and the precondition policy
// 2. Engine: instance, debug messenger, best GPU, logical device, compute queue
// 3. Host buffer (0..N) -> device buffer -> increment shader -> host buffer
// 4. Print input and output, tear the engine down
//
// =============================================================================

use anyhow::{Context, Result};
use vkcompute::backend::{result, validation, Engine};
use vkcompute::compute;
use vkcompute::config::Config;

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    validation::set_policy(config.validation_policy());
    result::set_verbose(config.engine.verbose_results);

    log::info!("Starting vkcompute");
    log::info!(
        "Shader: {:?}, {} elements",
        config.compute.shader_path,
        config.compute.element_count
    );

    let mut engine =
        Engine::init(&config.engine_settings()).context("Failed to initialize Vulkan")?;
    log::info!("Running on {}", engine.device_name());

    let input: Vec<u32> = (0..config.compute.element_count).collect();
    let output = compute::run_round_trip(&engine, &config.compute);

    // Tear down before reporting so a failed run still releases the device
    engine.wait_idle().ok();
    engine.deinit();

    let output = output.context("Compute round trip failed")?;

    println!("{}", format_row(&input));
    println!("{}", format_row(&output));

    let expected = input.iter().map(|v| v + 1);
    if output.iter().copied().ne(expected) {
        log::warn!("Output is not input + 1; is the configured shader the increment shader?");
    }

    Ok(())
}

/// Initialize logging; RUST_LOG overrides the configured level
fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();
    builder.init();
}

fn format_row(values: &[u32]) -> String {
    values.iter().map(|v| format!("{:3}", v)).collect()
}
