use std::{fs::File, io::BufReader, path::PathBuf, process::exit};

use clap_serde_derive::{
    clap::{self, Parser},
    ClapSerde,
};
use home::home_dir;
use serde::Deserialize;
use tracing::error;

use crate::ln::NodeConfig;

const DEFAULT_CONFIG_FILE_NAME: &str = "config.yml";

fn get_default_base_dir() -> PathBuf {
    let mut path = home_dir().expect("get home directory");
    path.push(".blitzd");
    path
}

fn get_default_config_file() -> PathBuf {
    let mut path = get_default_base_dir();
    path.push(DEFAULT_CONFIG_FILE_NAME);
    path
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// config file
    #[arg(short, long = "config", help = format!("config file [default: {:?} or $BASE_DIR/config.yml]", get_default_config_file()))]
    config_file: Option<PathBuf>,

    /// base directory
    #[arg(short = 'd', long = "dir", help = format!("base directory for all [default: {:?}]", get_default_base_dir()))]
    base_dir: Option<PathBuf>,

    /// config for the channel node
    #[command(flatten)]
    pub node: <NodeConfig as ClapSerde>::Opt,
}

#[derive(Deserialize)]
struct SerializedConfig {
    node: Option<<NodeConfig as ClapSerde>::Opt>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub node: NodeConfig,
}

impl Config {
    pub fn parse() -> Self {
        let args = Args::parse();
        let base_dir = args.base_dir.unwrap_or_else(get_default_base_dir);
        let config_file = args
            .config_file
            .unwrap_or_else(|| base_dir.join(DEFAULT_CONFIG_FILE_NAME));

        let serialized = match File::open(&config_file) {
            Ok(file) => match serde_yaml::from_reader::<_, SerializedConfig>(BufReader::new(file))
            {
                Ok(config) => Some(config),
                Err(err) => {
                    error!("failed to parse {:?}: {}", config_file, err);
                    exit(1);
                }
            },
            Err(_) => None,
        };

        let mut args_node = args.node;
        let mut node = match serialized.and_then(|config| config.node) {
            Some(from_file) => NodeConfig::from(from_file).merge(&mut args_node),
            None => NodeConfig::from(args_node),
        };
        if node.base_dir.is_none() {
            node.base_dir = Some(base_dir.join("node"));
        }

        Config { base_dir, node }
    }
}
