use clap::Parser;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// cask is a minimal container runtime for Linux
#[derive(Debug, Parser)]
#[command(name = "cask", author, version)]
pub struct CaskArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: CaskSubcommand,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum CaskSubcommand {
    /// Pull an image from the registry without launching anything
    #[command(name = "pull")]
    Pull {
        /// Image reference, `name[:tag]`
        image: String,
    },

    /// Pull an image if needed and run a command inside a container
    #[command(name = "run")]
    Run {
        /// Memory limit, e.g. 512mb
        #[arg(long)]
        mem: Option<String>,

        /// CPU share in percent of one core
        #[arg(long)]
        cpus: Option<u32>,

        /// Container address in CIDR form inside the bridge subnet
        #[arg(long)]
        ip: Option<String>,

        /// Image reference, `name[:tag]`
        image: String,

        /// Command and arguments to exec inside the container
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_parses_image_and_trailing_command() {
        let args = CaskArgs::parse_from([
            "cask", "run", "--mem", "64mb", "busybox:latest", "sh", "-c", "echo hi",
        ]);

        match args.subcommand {
            CaskSubcommand::Run {
                mem,
                image,
                command,
                ..
            } => {
                assert_eq!(mem.as_deref(), Some("64mb"));
                assert_eq!(image, "busybox:latest");
                assert_eq!(command, vec!["sh", "-c", "echo hi"]);
            }
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn test_run_requires_a_command() {
        assert!(CaskArgs::try_parse_from(["cask", "run", "busybox:latest"]).is_err());
    }

    #[test]
    fn test_pull_parses_image() {
        let args = CaskArgs::parse_from(["cask", "pull", "alpine"]);
        match args.subcommand {
            CaskSubcommand::Pull { image } => assert_eq!(image, "alpine"),
            _ => panic!("expected pull subcommand"),
        }
    }
}
