use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[command(
    author,
    version,
    about = "geotrace node - DP3T proximity tracing with spatio-temporal exposure tokens",
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Option<Subcommand>,

    #[clap(flatten)]
    pub run: RunCmd,
}

#[derive(Debug, Default, clap::Args)]
pub struct RunCmd {
    /// JSON configuration file; flags given here override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// real | mock | disabled
    #[arg(long)]
    pub scanner_mode: Option<String>,

    #[arg(long)]
    pub mock_peers: Option<u32>,

    #[arg(long)]
    pub mock_seed: Option<u64>,

    /// Scan cycle length in milliseconds.
    #[arg(long)]
    pub scan_interval: Option<u64>,

    /// Scan window length in milliseconds.
    #[arg(long)]
    pub scan_duration: Option<u64>,

    /// Location sampling interval in milliseconds.
    #[arg(long)]
    pub location_interval: Option<u64>,

    #[arg(long)]
    pub no_advertise: bool,

    #[arg(long)]
    pub no_receive: bool,

    /// Rotate the transmitter every minute instead of every epoch.
    #[arg(long)]
    pub calibration: bool,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long)]
    pub retention_days: Option<u32>,

    #[arg(long, allow_negative_numbers = true)]
    pub lat: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    pub lon: Option<f64>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    /// Delete every stored location, token and handshake.
    PurgeData,

    /// Log the number of stored records.
    Status,

    /// Match stored records against a downloaded exposure batch.
    CheckExposure {
        /// Saved JSON body of `/v1/exposedHashes/{batch}`.
        #[arg(long)]
        exposed_hashes: Option<PathBuf>,

        /// Saved protobuf body of `/v1/exposed/{batch}`.
        #[arg(long)]
        exposed_list: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "geotrace-node",
            "--scanner-mode",
            "mock",
            "--scan-interval",
            "5000",
            "--lat",
            "-33.8688",
            "--lon",
            "151.2093",
            "--no-advertise",
        ])
        .unwrap();
        assert!(cli.subcommand.is_none());
        assert_eq!(cli.run.scanner_mode.as_deref(), Some("mock"));
        assert_eq!(cli.run.scan_interval, Some(5_000));
        assert_eq!(cli.run.lat, Some(-33.8688));
        assert!(cli.run.no_advertise);
        assert_eq!(cli.run.log_level, "info");
    }

    #[test]
    fn parses_subcommand() {
        let cli = Cli::try_parse_from(["geotrace-node", "--data-dir", "/tmp/x", "purge-data"]).unwrap();
        assert!(matches!(cli.subcommand, Some(Subcommand::PurgeData)));
        assert_eq!(cli.run.data_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn parses_exposure_check() {
        let cli = Cli::try_parse_from([
            "geotrace-node",
            "--data-dir",
            "/tmp/x",
            "check-exposure",
            "--exposed-hashes",
            "/tmp/hashes.json",
        ])
        .unwrap();
        match cli.subcommand {
            Some(Subcommand::CheckExposure {
                exposed_hashes,
                exposed_list,
            }) => {
                assert_eq!(exposed_hashes, Some(PathBuf::from("/tmp/hashes.json")));
                assert!(exposed_list.is_none());
            }
            other => panic!("unexpected subcommand {other:?}"),
        }
    }
}
