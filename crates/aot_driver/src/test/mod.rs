#[macro_use]
mod run_scenario;
