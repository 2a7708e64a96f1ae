//! Command-line client for framekv.
//!
//! ```text
//! framekv-cli set k1 v1 ';' get k1 ';' del k1
//! ```
//!
//! Commands separated by `;` are sent as one pipelined batch and each
//! response is printed on its own line as `STATUS value`.

use clap::Parser;
use framekv::client::Client;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "framekv-cli")]
#[command(version)]
#[command(about = "Send commands to a framekv server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:1234")]
    addr: String,

    /// Command words; separate pipelined commands with ';'
    #[arg(required = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let commands = split_commands(&args.command);
    if commands.is_empty() {
        return Err("no command given".into());
    }

    debug!(addr = %args.addr, commands = commands.len(), "Connecting");
    let mut client = Client::connect(args.addr.as_str())?;
    let responses = client.pipeline(&commands)?;

    for response in responses {
        println!("{} {}", response.status, String::from_utf8_lossy(&response.value));
    }
    Ok(())
}

/// Split command words on standalone `;` separators, dropping empty commands.
fn split_commands(words: &[String]) -> Vec<Vec<String>> {
    words
        .split(|word| word == ";")
        .filter(|command| !command.is_empty())
        .map(<[String]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_single_command() {
        assert_eq!(split_commands(&words("get k1")), vec![words("get k1")]);
    }

    #[test]
    fn test_pipelined_commands() {
        assert_eq!(
            split_commands(&words("set k v ; get k ; ; del k ;")),
            vec![words("set k v"), words("get k"), words("del k")]
        );
    }

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["framekv-cli", "--addr", "10.0.0.1:4000", "get", "k"]);
        assert_eq!(args.addr, "10.0.0.1:4000");
        assert_eq!(args.command, words("get k"));
    }
}
