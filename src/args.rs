use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "voyager-probe")]
#[command(about = "Worker agent that traceroute-probes controller-assigned targets and reports per-hop measurements")]
#[command(version = "0.3.0")]
pub struct Args {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["voyager-probe"]).unwrap();
        assert!(!args.debug);
    }

    #[test]
    fn test_args_debug_flag() {
        let args = Args::try_parse_from(["voyager-probe", "-d"]).unwrap();
        assert!(args.debug);

        let args = Args::try_parse_from(["voyager-probe", "--debug"]).unwrap();
        assert!(args.debug);
    }

    #[test]
    fn test_args_rejects_unknown_flags() {
        assert!(Args::try_parse_from(["voyager-probe", "--target", "8.8.8.8"]).is_err());
    }
}
