use std::fmt;

pub const DEFAULT_CONFIG_PATH: &str = "snova.json";

/// `snova <version> (<os> <arch>)`.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: snova [options...]\n",
        "Options:\n",
        "  -h, --help                      Display this help menu and exit\n",
        "  -V, --version                   Display the version number and exit\n",
        "  -v, --verbose                   Display additional information while running\n",
        "  -s, --silent                    Do not print logs to stdout\n",
        "  -c, --config <path>             Load the JSON configuration file at this path (default snova.json)\n",
        "  --server                        Run only the server section of the configuration\n",
        "  --client                        Run only the client section of the configuration\n",
        "\n",
        "Without --server or --client, every section present in the configuration file is run.\n",
    )
}

/// What the command line asks for.
#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    /// `--help`: print usage and exit.
    Help,

    /// `--version`: print the version and exit.
    Version,

    Run(StartupArguments),
}

/// Which sections of the configuration file to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    Client,
    Server,
    Both,
}

impl StartupMode {
    pub fn runs_client(self) -> bool {
        matches!(self, Self::Client | Self::Both)
    }

    pub fn runs_server(self) -> bool {
        matches!(self, Self::Server | Self::Both)
    }
}

#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    pub config_path: String,
    pub mode: StartupMode,
    pub verbose: bool,
    pub silent: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingConfigPath(String),
    RepeatedConfigPath(String),
    ClientFoundServerArgument(String),
    ServerFoundClientArgument(String),
    VerboseAndSilent,
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unrecognized argument: {arg}"),
            Self::MissingConfigPath(arg) => write!(f, "Expected a file path after {arg}"),
            Self::RepeatedConfigPath(arg) => write!(f, "A configuration file was already specified before {arg}"),
            Self::ClientFoundServerArgument(arg) => {
                write!(f, "{arg} asks for server mode, but --client was already given")
            }
            Self::ServerFoundClientArgument(arg) => {
                write!(f, "{arg} asks for client mode, but --server was already given")
            }
            Self::VerboseAndSilent => write!(f, "Cannot be both verbose and silent"),
        }
    }
}

struct StartupArgumentsParser {
    config_path: Option<String>,
    mode: Option<StartupMode>,
    verbose: bool,
    silent: bool,
}

impl StartupArgumentsParser {
    fn new() -> Self {
        Self {
            config_path: None,
            mode: None,
            verbose: false,
            silent: false,
        }
    }

    fn set_mode(&mut self, arg: String, mode: StartupMode) -> Result<(), ArgumentsError> {
        match (self.mode, mode) {
            (Some(StartupMode::Client), StartupMode::Server) => Err(ArgumentsError::ClientFoundServerArgument(arg)),
            (Some(StartupMode::Server), StartupMode::Client) => Err(ArgumentsError::ServerFoundClientArgument(arg)),
            _ => {
                self.mode = Some(mode);
                Ok(())
            }
        }
    }

    fn complete(self) -> Result<StartupArguments, ArgumentsError> {
        if self.verbose && self.silent {
            return Err(ArgumentsError::VerboseAndSilent);
        }

        Ok(StartupArguments {
            config_path: self.config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
            mode: self.mode.unwrap_or(StartupMode::Both),
            verbose: self.verbose,
            silent: self.silent,
        })
    }
}

fn try_parse_general_argument(result: &mut StartupArgumentsParser, maybe_arg: &mut Option<String>) -> Result<bool, ArgumentsError> {
    let arg = match maybe_arg.take() {
        Some(arg) => arg,
        None => return Ok(false),
    };

    if arg.eq("-v") || arg.eq_ignore_ascii_case("--verbose") {
        result.verbose = true;
    } else if arg.eq("-s") || arg.eq_ignore_ascii_case("--silent") {
        result.silent = true;
    } else if arg.eq_ignore_ascii_case("--server") {
        result.set_mode(arg, StartupMode::Server)?;
    } else if arg.eq_ignore_ascii_case("--client") {
        result.set_mode(arg, StartupMode::Client)?;
    } else {
        *maybe_arg = Some(arg);
        return Ok(false);
    }

    Ok(true)
}

fn try_parse_config_argument<F>(
    result: &mut StartupArgumentsParser,
    maybe_arg: &mut Option<String>,
    get_next_arg: F,
) -> Result<bool, ArgumentsError>
where
    F: FnOnce() -> Option<String>,
{
    let arg = match maybe_arg.take() {
        Some(arg) => arg,
        None => return Ok(false),
    };

    if !arg.eq("-c") && !arg.eq_ignore_ascii_case("--config") {
        *maybe_arg = Some(arg);
        return Ok(false);
    }

    if result.config_path.is_some() {
        return Err(ArgumentsError::RepeatedConfigPath(arg));
    }

    match get_next_arg() {
        Some(path) if !path.is_empty() && !path.starts_with('-') => {
            result.config_path = Some(path);
            Ok(true)
        }
        _ => Err(ArgumentsError::MissingConfigPath(arg)),
    }
}

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut result = StartupArgumentsParser::new();

    // Program name
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        }

        let mut maybe_arg = Some(arg);
        let _ = !try_parse_general_argument(&mut result, &mut maybe_arg)?
            && !try_parse_config_argument(&mut result, &mut maybe_arg, || args.next())?;

        if let Some(arg) = maybe_arg {
            return Err(ArgumentsError::UnknownArgument(arg));
        }
    }

    Ok(ArgumentsRequest::Run(result.complete()?))
}
