use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "plinth-server", about = "Plinth 3D-asset streaming relay")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/plinth.toml")]
    pub config: String,
}
