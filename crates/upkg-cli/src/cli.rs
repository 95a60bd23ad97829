use clap::{ArgAction, Parser, Subcommand, ValueHint};

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    help_template = "{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}",
    arg_required_else_help = true
)]
pub struct Args {
    /// Set output verbosity
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress outputs
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output as json
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Disable colors in output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Provide custom config file
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    pub config: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install a local package file
    #[command(arg_required_else_help = true)]
    #[clap(name = "install", visible_alias = "i", visible_alias = "add")]
    Install {
        /// Package file (.deb, .rpm, .AppImage, archive or ELF binary)
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        file: String,

        /// Replace an existing installation with the same name
        #[arg(required = false, short, long)]
        force: bool,

        /// Don't create a desktop entry
        #[arg(required = false, long)]
        skip_desktop: bool,

        /// Install under this name instead of the one derived from the file
        #[arg(required = false, short, long)]
        name: Option<String>,

        /// Don't prefix launchers with the Wayland environment
        #[arg(required = false, long)]
        skip_wayland_env: bool,

        /// Let pacman overwrite conflicting files
        #[arg(required = false, long)]
        overwrite: bool,
    },

    /// Uninstall packages
    #[command(arg_required_else_help = true)]
    #[clap(name = "uninstall", visible_alias = "remove", visible_alias = "r")]
    Uninstall {
        /// Package names or install ids
        #[arg(required_unless_present = "all")]
        packages: Vec<String>,

        /// Uninstall every installed package
        #[arg(required = false, long, conflicts_with = "packages")]
        all: bool,
    },

    /// List installed packages
    #[clap(name = "list", visible_alias = "ls")]
    List {
        /// Only show packages of this type
        #[arg(required = false, short = 't', long = "type")]
        package_type: Option<String>,
    },

    /// Show details of an installed package
    #[command(arg_required_else_help = true)]
    #[clap(name = "info", visible_alias = "show")]
    Info {
        /// Package name or install id
        #[arg(required = true)]
        package: String,
    },

    /// List the available install backends
    Backends,

    /// Print the configuration file to stdout
    Config,

    /// Generate default config
    #[clap(name = "defconfig")]
    DefConfig,
}
