use std::{thread::sleep, time::Duration};

use anyhow::Result;
use clap::Parser;

use httpisp::constants::DEFAULT_SPI_FREQ;
use httpisp::sim::SimAvr;
use httpisp::{HttpTransport, PartDb, Programmer, ProgrammerState, ResetControl};

#[derive(clap::Parser)]
#[clap(
    name = "httpisp",
    about = "STK500-over-HTTP bridge for programming AVR MCUs, with a built-in simulated target"
)]
enum Cli {
    /// Serve the STK500 command endpoint against a simulated AVR
    Serve {
        /// Address to listen on
        #[clap(long, default_value = "127.0.0.1:8266")]
        listen: String,
        /// Part the simulated target reports and sizes itself as
        #[clap(long, default_value = "atmega328p")]
        part: String,
        /// SPI clock in Hz applied while a session is programming
        #[clap(long, default_value_t = DEFAULT_SPI_FREQ)]
        spi_freq: u32,
        /// Reset line is inverted by external level-shifting hardware
        #[clap(long)]
        active_high_reset: bool,
    },
    /// List the parts the simulator knows
    Parts {},
}

fn main() -> Result<()> {
    let _ = simplelog::TermLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match Cli::parse() {
        Cli::Serve {
            listen,
            part,
            spi_freq,
            active_high_reset,
        } => {
            let part = PartDb::find(&part)?;
            log::info!("simulated target: {}", part);

            let sim = SimAvr::new(part);
            let reset = ResetControl::new(sim.reset_line(), active_high_reset, false);
            let transport = HttpTransport::bind(&listen)?;
            let mut programmer = Programmer::new(sim, reset, transport, spi_freq);

            loop {
                let state = programmer.serve()?;
                // stay responsive while a session is up, back off when idle
                let nap = if state == ProgrammerState::Idle { 10 } else { 1 };
                sleep(Duration::from_millis(nap));
            }
        }
        Cli::Parts {} => {
            for part in PartDb::all()? {
                println!("{}", part);
            }
        }
    }

    Ok(())
}
