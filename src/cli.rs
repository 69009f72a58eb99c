use clap::Parser;
use std::path::PathBuf;

/// toolgate: MCP gateway federating backend MCP servers.
#[derive(Parser, Debug)]
#[command(name = "toolgate", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "toolgate.yaml")]
    pub config: PathBuf,

    /// Serve MCP over HTTP instead of stdio.
    #[arg(long)]
    pub http: bool,

    /// Listen address for the HTTP surface (overrides the config).
    #[arg(long)]
    pub listen: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["toolgate"]);
        assert_eq!(cli.config, PathBuf::from("toolgate.yaml"));
        assert!(!cli.http);
        assert!(cli.listen.is_none());
    }

    #[test]
    fn test_http_flags() {
        let cli = Cli::parse_from(["toolgate", "--http", "--listen", "0.0.0.0:9000", "-c", "gw.yaml"]);
        assert!(cli.http);
        assert_eq!(cli.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(cli.config, PathBuf::from("gw.yaml"));
    }
}
