mod capture;
mod cli;
mod command;
mod config;
mod display;
mod driver;
mod fanout;
mod inference;
mod ipc;
mod keypoint;
mod logging;
mod relay;
mod tracker;
mod transport;
mod worker;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
