use clap::Parser;
use ctmirror_dissect::dissect_capture;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dissect captured ctmirror sync traffic")]
struct Args {
    /// Capture file in classic pcap format.
    pcap_file: PathBuf,
    /// Sync port to filter on.
    #[arg(long, default_value_t = ctmirror_proto::SYNC_PORT)]
    port: u16,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let data = match std::fs::read(&args.pcap_file) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("couldn't open pcap file {}: {}", args.pcap_file.display(), err);
            return ExitCode::FAILURE;
        }
    };
    let mut stdout = std::io::stdout().lock();
    match dissect_capture(&data, args.port, &mut stdout) {
        Ok(stats) => {
            println!(
                "Done. packets={} errors={} skip={}",
                stats.pkts, stats.errors, stats.skip
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
