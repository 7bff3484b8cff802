//! `scr`: offline tooling for the ISO/IEC 7816-3 protocol engine

use clap::{Parser, Subcommand, ValueEnum};
use nexum_scr_core::atr::Protocol;
use nexum_scr_core::config::DEFAULT_CLOCK_FREQUENCY;
use nexum_scr_core::timing::DEFAULT_FD_INDEX;

mod commands;
mod display;

use commands::*;

#[derive(Parser)]
#[command(version, about = "Smart card reader protocol toolbox")]
struct Cli {
    /// Debug level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode an Answer-To-Reset
    Atr {
        /// ATR bytes in hex
        #[arg(required = true)]
        atr: String,

        /// Reader clock in Hz
        #[arg(long, default_value_t = DEFAULT_CLOCK_FREQUENCY)]
        clock: u32,
    },

    /// Build a PPS request and optionally check the card's answer
    Pps {
        /// Protocol type to request
        #[arg(short, long, default_value_t = 0)]
        protocol: u8,

        /// Clock rate conversion index
        #[arg(long)]
        fi: Option<u8>,

        /// Baud rate adjustment index
        #[arg(long)]
        di: Option<u8>,

        /// Optional PPS2 (SPU) byte
        #[arg(long)]
        spu: Option<u8>,

        /// Card answer in hex
        #[arg(short, long)]
        response: Option<String>,
    },

    /// Classify a command APDU
    Classify {
        /// APDU bytes in hex
        #[arg(required = true)]
        apdu: String,
    },

    /// Show timing budgets
    Timing {
        /// Card clock in Hz
        #[arg(long, default_value_t = 3_571_200)]
        clock: u32,

        /// Clock rate conversion index
        #[arg(long, default_value_t = DEFAULT_FD_INDEX)]
        fi: u8,

        /// Baud rate adjustment index
        #[arg(long, default_value_t = DEFAULT_FD_INDEX)]
        di: u8,

        /// T=1 character waiting time integer
        #[arg(long, default_value_t = 13)]
        cwi: u8,

        /// T=1 block waiting time integer
        #[arg(long, default_value_t = 4)]
        bwi: u8,

        /// T=0 waiting time integer
        #[arg(long, default_value_t = 10)]
        wi: u8,
    },

    /// Reset a simulated card and exchange one APDU
    Simulate {
        /// Protocol spoken by the card
        #[arg(short, long, value_enum, default_value_t = SimProtocol::T0)]
        protocol: SimProtocol,

        /// Negotiate the rate offered in TA1 before the exchange
        #[arg(long)]
        pps: bool,

        /// Drive the session through a worker thread
        #[arg(long)]
        threaded: bool,

        /// APDU bytes in hex
        #[arg(default_value = "00A4040000")]
        apdu: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SimProtocol {
    T0,
    T1,
}

impl From<SimProtocol> for Protocol {
    fn from(protocol: SimProtocol) -> Self {
        match protocol {
            SimProtocol::T0 => Self::T0,
            SimProtocol::T1 => Self::T1,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose);

    match &cli.command {
        Commands::Atr { atr, clock } => atr_command(atr, *clock)?,
        Commands::Pps {
            protocol,
            fi,
            di,
            spu,
            response,
        } => pps_command(*protocol, *fi, *di, *spu, response.as_deref())?,
        Commands::Classify { apdu } => classify_command(apdu)?,
        Commands::Timing {
            clock,
            fi,
            di,
            cwi,
            bwi,
            wi,
        } => timing_command(*clock, *fi, *di, *cwi, *bwi, *wi)?,
        Commands::Simulate {
            protocol,
            pps,
            threaded,
            apdu,
        } => simulate_command((*protocol).into(), apdu, *pps, *threaded)?,
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
}
