// When 'lib.rs' exists, cargo treats 'main.rs' as a separate crate
use aot_common::report_error::Reportable;
use aot_driver::cli::Config;
use aot_driver::handle_config;

use std::io;

fn main() {
    better_panic::install();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = Config::from_args();
    let result = handle_config(config, &mut io::stdout().lock());
    if let Err(err) = result {
        let _ = err.report(&mut io::stderr().lock());
        std::process::exit(err.exit_status());
    }
}
