// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use clap::{Parser, Subcommand, ValueEnum};
use serialport::{DataBits, Parity, StopBits};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use lora_link::link::{Completion, LinkAdapter, LinkConfig, LinkError, Notification};
use lora_link::serial::RealSerialPort;

/// Longest the driver loop blocks on the port before checking notifications
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "lora-link")]
#[command(about = "Reliable chunked packet transfer over an E22-400T22U LoRa serial adapter", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits
    #[arg(long, value_enum, default_value = "8", value_name = "BITS")]
    data_bits: DataBitsArg,

    /// Parity
    #[arg(long, value_enum, default_value = "none")]
    parity: ParityArg,

    /// Stop bits
    #[arg(long, value_enum, default_value = "1", value_name = "BITS")]
    stop_bits: StopBitsArg,

    /// Retransmissions of a chunk before the packet is abandoned
    #[arg(long, default_value = "5", value_name = "N")]
    max_retries: u32,

    /// Time to wait for an acknowledgment before retransmitting
    #[arg(long, default_value = "1000", value_name = "MS")]
    ack_timeout_ms: u64,

    /// Treat a send as finished only once the receiver confirms the whole packet
    #[arg(long)]
    wait_packet_ack: bool,

    /// Look for several frames in each read from the port
    #[arg(long)]
    scan_frames: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file as a single packet
    Send {
        /// File to send
        file: PathBuf,
    },
    /// Receive packets and save each one to a file
    Receive {
        /// Directory to save received packets
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Packets to receive before exiting (0 = run until interrupted)
        #[arg(short, long, default_value = "1")]
        count: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DataBitsArg {
    #[value(name = "5")]
    Five,
    #[value(name = "6")]
    Six,
    #[value(name = "7")]
    Seven,
    #[value(name = "8")]
    Eight,
}

impl From<DataBitsArg> for DataBits {
    fn from(bits: DataBitsArg) -> Self {
        match bits {
            DataBitsArg::Five => DataBits::Five,
            DataBitsArg::Six => DataBits::Six,
            DataBitsArg::Seven => DataBits::Seven,
            DataBitsArg::Eight => DataBits::Eight,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ParityArg {
    None,
    Odd,
    Even,
}

impl From<ParityArg> for Parity {
    fn from(parity: ParityArg) -> Self {
        match parity {
            ParityArg::None => Parity::None,
            ParityArg::Odd => Parity::Odd,
            ParityArg::Even => Parity::Even,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StopBitsArg {
    #[value(name = "1")]
    One,
    #[value(name = "2")]
    Two,
}

impl From<StopBitsArg> for StopBits {
    fn from(bits: StopBitsArg) -> Self {
        match bits {
            StopBitsArg::One => StopBits::One,
            StopBitsArg::Two => StopBits::Two,
        }
    }
}

impl Cli {
    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            max_retries: self.max_retries,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            completion: if self.wait_packet_ack { Completion::PacketAck } else { Completion::ChunkAck },
            scan_frames: self.scan_frames,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Link(#[from] LinkError),

    #[error("packet was not delivered")]
    NotDelivered,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let data_bits = DataBits::from(cli.data_bits);
    let parity = Parity::from(cli.parity);
    let stop_bits = StopBits::from(cli.stop_bits);

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    let config = cli.link_config();

    match cli.command {
        Commands::Send { file } => {
            println!("\nSending file: {}", file.display());
            if let Err(e) = send_file(serial_port, config, &file) {
                eprintln!("Send failed: {}", e);
                std::process::exit(1);
            }
            println!("\nFile sent successfully!");
        }
        Commands::Receive { output_dir, count } => {
            println!("\nReceiving packets to: {}", output_dir.display());
            if let Err(e) = receive_packets(serial_port, config, &output_dir, count) {
                eprintln!("Receive failed: {}", e);
                std::process::exit(1);
            }
            println!("\nPackets received successfully!");
        }
    }
}

fn send_file(serial_port: RealSerialPort, config: LinkConfig, file: &Path) -> Result<(), TransferError> {
    let data = std::fs::read(file)?;

    let (tx, rx) = mpsc::channel();
    let mut link = LinkAdapter::new(Box::new(serial_port), config, tx);
    link.send_packet(&data);

    let mut last_error = None;
    loop {
        for notification in rx.try_iter() {
            match notification {
                Notification::SendProgress { sent, total } => {
                    print!("\rSent {}/{} bytes", sent, total);
                    std::io::stdout().flush().ok();
                }
                Notification::PacketSent(true) => return Ok(()),
                Notification::PacketSent(false) => {
                    return Err(last_error.map_or(TransferError::NotDelivered, TransferError::Link));
                }
                Notification::Error(e) => {
                    tracing::debug!(error = %e, "link error");
                    last_error = Some(e);
                }
                Notification::PacketReceived(data) => {
                    tracing::debug!(bytes = data.len(), "ignoring inbound packet while sending");
                }
                Notification::ReceiveProgress { .. } => {}
            }
        }

        link.poll(POLL_INTERVAL)?;
    }
}

fn receive_packets(
    serial_port: RealSerialPort,
    config: LinkConfig,
    output_dir: &Path,
    count: u32,
) -> Result<(), TransferError> {
    if !output_dir.is_dir() {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Output directory not found: {}", output_dir.display()),
        )));
    }

    let (tx, rx) = mpsc::channel();
    let mut link = LinkAdapter::new(Box::new(serial_port), config, tx);

    let mut saved = 0u32;
    while count == 0 || saved < count {
        link.poll(POLL_INTERVAL)?;

        for notification in rx.try_iter() {
            match notification {
                Notification::ReceiveProgress { received, total } => {
                    print!("\rReceived {}/{} bytes", received, total);
                    std::io::stdout().flush().ok();
                }
                Notification::PacketReceived(data) => {
                    saved += 1;
                    let path = output_dir.join(format!("packet-{:04}.bin", saved));
                    std::fs::write(&path, &data)?;
                    println!("\nSaved {} bytes to {}", data.len(), path.display());
                }
                Notification::Error(e) => tracing::warn!(error = %e, "link error"),
                Notification::PacketSent(_) | Notification::SendProgress { .. } => {}
            }
        }
    }

    Ok(())
}
