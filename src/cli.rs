// Command line parsing for the camview binary

use std::path::PathBuf;

use anyhow::{bail, Context};

pub const USAGE: &str = "\
Usage: camview [OPTIONS]

Options:
  --list            List cameras and exit
  --json            With --list, print JSON
  --camera N        Show camera with index N (repeatable, default: first)
  --width W         Requested capture width
  --height H        Requested capture height
  --scale F         Downscale frames handed to sinks by F
  --seconds S       Run for S seconds (0 = until every camera stops)
  --config PATH     Config file (default: <config dir>/camview/config.toml)
  --verbose         Debug logging
  --help            Show this help";

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Options {
    pub list: bool,
    pub json: bool,
    pub cameras: Vec<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub scale: u32,
    pub seconds: u64,
    pub config: Option<PathBuf>,
    pub verbose: bool,
    pub help: bool,
}

impl Options {
    /// Parse arguments, program name excluded
    pub fn parse<S: AsRef<str>>(args: &[S]) -> anyhow::Result<Self> {
        let mut options = Options {
            scale: 1,
            ..Options::default()
        };

        let mut iter = args.iter().map(|a| a.as_ref());
        while let Some(arg) = iter.next() {
            match arg {
                "--list" => options.list = true,
                "--json" => options.json = true,
                "--verbose" | "-v" => options.verbose = true,
                "--help" | "-h" => options.help = true,
                "--camera" => options.cameras.push(number(arg, iter.next())?),
                "--width" => options.width = Some(number(arg, iter.next())?),
                "--height" => options.height = Some(number(arg, iter.next())?),
                "--scale" => options.scale = number::<u32>(arg, iter.next())?.max(1),
                "--seconds" => options.seconds = number(arg, iter.next())?,
                "--config" => {
                    let path = iter.next().with_context(|| format!("{} needs a value", arg))?;
                    options.config = Some(PathBuf::from(path));
                }
                other => bail!("Unknown argument: {}", other),
            }
        }

        if options.json && !options.list {
            bail!("--json only applies to --list");
        }

        Ok(options)
    }
}

fn number<T>(flag: &str, value: Option<&str>) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = value.with_context(|| format!("{} needs a value", flag))?;
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", flag, value))
}
