//! Print the schedule a pump channel would follow for a volume, used
//! when calibrating pumps.

use aquaflux::components::{
    outputs::channel::{ChannelConfig, FlowMode},
    prelude::*,
};
use clap::Parser;
use std::process::ExitCode;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Volume in ml, negative runs a motor pump in reverse.
    #[arg(allow_hyphen_values = true)]
    volume: f64,
    /// Output config file to take the channel options from.
    #[arg(short, long)]
    config: Option<String>,
    /// Channel of the output config.
    #[arg(long, default_value_t = 0)]
    channel: u8,
    /// Desired average rate in ml/min, the fastest rate when not given.
    /// Ignored with --config.
    #[arg(short, long)]
    rate: Option<f64>,
    /// Calibrated rate at 100 % in ml/min, ignored with --config.
    #[arg(long, default_value_t = 150.0)]
    fastest: f64,
    /// Shortest on period per sub-cycle in seconds, ignored with --config.
    #[arg(long, default_value_t = 1.0)]
    min_on: f64,
}

fn channel_config(args: &Args) -> aquaflux::error::Result<ChannelConfig> {
    match &args.config {
        Some(filepath) => OutputConfig::from_file(filepath)?.channel(args.channel),
        None => {
            let mut channel = ChannelConfig {
                fastest_dispense_rate_ml_min: args.fastest,
                minimum_sec_on_per_min: args.min_on,
                ..Default::default()
            };
            if let Some(rate) = args.rate {
                channel.flow_mode = FlowMode::SpecifyFlowRate;
                channel.flow_rate = rate;
            }
            channel.validate(args.channel)?;
            Ok(channel)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let result = channel_config(&args).and_then(|channel| plan(args.volume, &channel));
    match result {
        Ok(plan) => {
            println!("{}", plan.describe());
            println!("  rate:       {:.2} ml/min", plan.rate_ml_min);
            println!("  duty cycle: {:.1} %", plan.duty_cycle * 100.0);
            println!("  on / off:   {:.1} s / {:.1} s", plan.seconds_on, plan.seconds_off);
            if let Some(cycle) = plan.cycle {
                println!(
                    "  sub-cycle:  {:.1} s on, {:.1} s off, {:.2} repeats",
                    cycle.on_seconds,
                    cycle.off_seconds,
                    plan.repeats()
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
