//! Program configurations.

use std::{env, error::Error as StdError, str::FromStr, time::Duration};

use clap::{Arg, ArgMatches, Command, builder::BoolishValueParser};
use serde::Deserialize;

use super::{
    lora_task::Options as StackOptions,
    stack::ConnectParams,
    uplink::Options as UplinkOptions,
};

/// Configuration file object.
#[derive(Default, Deserialize)]
pub struct Config {
    /// Serial port device path such as `/dev/ttyACM0` or `COM1`.
    #[serde(rename = "devPath")]
    pub dev_path: Option<String>,
    pub freq: Option<u32>,
    pub power: Option<u8>,
    /// I2C bus of the sensor such as `/dev/i2c-1`.
    #[serde(rename = "i2cPath")]
    pub i2c_path: Option<String>,
    /// Sensor type: `shtc3` or `sim`.
    pub sensor: Option<String>,
    #[serde(rename = "devEui")]
    pub dev_eui: Option<String>,
    #[serde(rename = "appEui")]
    pub app_eui: Option<String>,
    #[serde(rename = "appKey")]
    pub app_key: Option<String>,
    #[serde(rename = "joinTrials")]
    pub join_trials: Option<u8>,
    #[serde(rename = "confirmedRetries")]
    pub confirmed_retries: Option<u8>,
    pub adr: Option<bool>,
    pub confirmed: Option<bool>,
    pub port: Option<u8>,
    pub channel: Option<u8>,
    /// Steady uplink interval in milliseconds.
    #[serde(rename = "txInterval")]
    pub tx_interval: Option<u64>,
    /// Retry delay after a duty-cycle restriction in milliseconds.
    pub backoff: Option<u64>,
    /// Duty-cycle quiet time between two uplinks in milliseconds.
    #[serde(rename = "txGap")]
    pub tx_gap: Option<u64>,
}

pub const SENSOR_SHTC3: &'static str = "shtc3";
pub const SENSOR_SIM: &'static str = "sim";

pub const DEF_DEV_PATH: &'static str = "/dev/ttyACM0";
pub const DEF_FREQ: u32 = 91500;
pub const DEF_FREQ_STR: &'static str = "91500";
pub const DEF_POWER: u8 = 0;
pub const DEF_POWER_STR: &'static str = "0";
pub const DEF_I2C_PATH: &'static str = "/dev/i2c-1";
pub const DEF_SENSOR: &'static str = SENSOR_SHTC3;
pub const DEF_DEV_EUI: &'static str = "00a77c67d2b17fb3";
pub const DEF_APP_EUI: &'static str = "70b3d57ed000aadf";
pub const DEF_APP_KEY: &'static str = "88fac31fb53dcae9febb42f569c51894";
pub const DEF_JOIN_TRIALS: u8 = 10;
pub const DEF_JOIN_TRIALS_STR: &'static str = "10";
pub const DEF_CONFIRMED_RETRIES: u8 = 3;
pub const DEF_CONFIRMED_RETRIES_STR: &'static str = "3";
pub const DEF_ADR: bool = false;
pub const DEF_CONFIRMED: bool = false;
pub const DEF_PORT: u8 = 15;
pub const DEF_PORT_STR: &'static str = "15";
pub const DEF_CHANNEL: u8 = 1;
pub const DEF_CHANNEL_STR: &'static str = "1";
pub const DEF_TX_INTERVAL: u64 = 10000;
pub const DEF_TX_INTERVAL_STR: &'static str = "10000";
pub const DEF_BACKOFF: u64 = 3000;
pub const DEF_BACKOFF_STR: &'static str = "3000";
pub const DEF_TX_GAP: u64 = 5000;
pub const DEF_TX_GAP_STR: &'static str = "5000";

/// To register Clap arguments.
pub fn reg_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("uplink-demo.dev-path")
            .long("uplink-demo.dev-path")
            .help("Device path such as `/dev/ttyACM0` or `COM1`")
            .num_args(1)
            .default_value(DEF_DEV_PATH),
    )
    .arg(
        Arg::new("uplink-demo.freq")
            .long("uplink-demo.freq")
            .help("Frequency (10kHz). 86000~102000")
            .num_args(1)
            .value_parser(86000..=102000)
            .default_value(DEF_FREQ_STR),
    )
    .arg(
        Arg::new("uplink-demo.power")
            .long("uplink-demo.power")
            .help("RF power. 0~15 for 2~17 dBm")
            .num_args(1)
            .value_parser(0..=15)
            .default_value(DEF_POWER_STR),
    )
    .arg(
        Arg::new("uplink-demo.i2c-path")
            .long("uplink-demo.i2c-path")
            .help("I2C bus of the temperature sensor")
            .num_args(1)
            .default_value(DEF_I2C_PATH),
    )
    .arg(
        Arg::new("uplink-demo.sensor")
            .long("uplink-demo.sensor")
            .help("Temperature sensor")
            .num_args(1)
            .value_parser([SENSOR_SHTC3, SENSOR_SIM])
            .default_value(DEF_SENSOR),
    )
    .arg(
        Arg::new("uplink-demo.dev-eui")
            .long("uplink-demo.dev-eui")
            .help("Device EUI (16 hexadecimal digits)")
            .num_args(1)
            .default_value(DEF_DEV_EUI),
    )
    .arg(
        Arg::new("uplink-demo.app-eui")
            .long("uplink-demo.app-eui")
            .help("Application EUI (16 hexadecimal digits)")
            .num_args(1)
            .default_value(DEF_APP_EUI),
    )
    .arg(
        Arg::new("uplink-demo.app-key")
            .long("uplink-demo.app-key")
            .help("Application key (32 hexadecimal digits)")
            .num_args(1)
            .default_value(DEF_APP_KEY),
    )
    .arg(
        Arg::new("uplink-demo.join-trials")
            .long("uplink-demo.join-trials")
            .help("Join attempts before giving up. 1~255")
            .num_args(1)
            .value_parser(1..=255)
            .default_value(DEF_JOIN_TRIALS_STR),
    )
    .arg(
        Arg::new("uplink-demo.confirmed-retries")
            .long("uplink-demo.confirmed-retries")
            .help("Retries of confirmed messages")
            .num_args(1)
            .value_parser(0..=255)
            .default_value(DEF_CONFIRMED_RETRIES_STR),
    )
    .arg(
        Arg::new("uplink-demo.adr")
            .long("uplink-demo.adr")
            .help("Enable adaptive data rate")
            .num_args(1)
            .value_parser(BoolishValueParser::new())
            .default_value("false"),
    )
    .arg(
        Arg::new("uplink-demo.confirmed")
            .long("uplink-demo.confirmed")
            .help("Send confirmed uplinks")
            .num_args(1)
            .value_parser(BoolishValueParser::new())
            .default_value("false"),
    )
    .arg(
        Arg::new("uplink-demo.port")
            .long("uplink-demo.port")
            .help("Application port. 1~223")
            .num_args(1)
            .value_parser(1..=223)
            .default_value(DEF_PORT_STR),
    )
    .arg(
        Arg::new("uplink-demo.channel")
            .long("uplink-demo.channel")
            .help("LPP channel of the temperature record")
            .num_args(1)
            .value_parser(0..=255)
            .default_value(DEF_CHANNEL_STR),
    )
    .arg(
        Arg::new("uplink-demo.tx-interval")
            .long("uplink-demo.tx-interval")
            .help("Uplink interval in milliseconds")
            .num_args(1)
            .value_parser(1..)
            .default_value(DEF_TX_INTERVAL_STR),
    )
    .arg(
        Arg::new("uplink-demo.backoff")
            .long("uplink-demo.backoff")
            .help("Retry delay after duty-cycle restriction in milliseconds")
            .num_args(1)
            .value_parser(1..)
            .default_value(DEF_BACKOFF_STR),
    )
    .arg(
        Arg::new("uplink-demo.tx-gap")
            .long("uplink-demo.tx-gap")
            .help("Duty-cycle quiet time between uplinks in milliseconds")
            .num_args(1)
            .value_parser(0..)
            .default_value(DEF_TX_GAP_STR),
    )
}

/// To read input arguments from command-line arguments and environment variables.
///
/// This function will call [`apply_default()`] to fill missing values so you do not need call it
/// again.
pub fn read_args(args: &ArgMatches) -> Config {
    apply_default(&Config {
        dev_path: read_str(args, "uplink-demo.dev-path", "UPLINK_DEMO_DEV_PATH"),
        freq: read_num(args, "uplink-demo.freq", "UPLINK_DEMO_FREQ"),
        power: read_num(args, "uplink-demo.power", "UPLINK_DEMO_POWER"),
        i2c_path: read_str(args, "uplink-demo.i2c-path", "UPLINK_DEMO_I2C_PATH"),
        sensor: read_str(args, "uplink-demo.sensor", "UPLINK_DEMO_SENSOR"),
        dev_eui: read_str(args, "uplink-demo.dev-eui", "UPLINK_DEMO_DEV_EUI"),
        app_eui: read_str(args, "uplink-demo.app-eui", "UPLINK_DEMO_APP_EUI"),
        app_key: read_str(args, "uplink-demo.app-key", "UPLINK_DEMO_APP_KEY"),
        join_trials: read_num(args, "uplink-demo.join-trials", "UPLINK_DEMO_JOIN_TRIALS"),
        confirmed_retries: read_num(
            args,
            "uplink-demo.confirmed-retries",
            "UPLINK_DEMO_CONFIRMED_RETRIES",
        ),
        adr: read_bool(args, "uplink-demo.adr", "UPLINK_DEMO_ADR"),
        confirmed: read_bool(args, "uplink-demo.confirmed", "UPLINK_DEMO_CONFIRMED"),
        port: read_num(args, "uplink-demo.port", "UPLINK_DEMO_PORT"),
        channel: read_num(args, "uplink-demo.channel", "UPLINK_DEMO_CHANNEL"),
        tx_interval: read_num(args, "uplink-demo.tx-interval", "UPLINK_DEMO_TX_INTERVAL"),
        backoff: read_num(args, "uplink-demo.backoff", "UPLINK_DEMO_BACKOFF"),
        tx_gap: read_num(args, "uplink-demo.tx-gap", "UPLINK_DEMO_TX_GAP"),
    })
}

/// Fill missing configuration with default values.
pub fn apply_default(config: &Config) -> Config {
    Config {
        dev_path: match config.dev_path.as_ref() {
            None => Some(DEF_DEV_PATH.to_string()),
            Some(path) => Some(path.clone()),
        },
        freq: Some(config.freq.unwrap_or(DEF_FREQ)),
        power: Some(config.power.unwrap_or(DEF_POWER)),
        i2c_path: match config.i2c_path.as_ref() {
            None => Some(DEF_I2C_PATH.to_string()),
            Some(path) => Some(path.clone()),
        },
        sensor: match config.sensor.as_ref() {
            None => Some(DEF_SENSOR.to_string()),
            Some(sensor) => Some(sensor.clone()),
        },
        dev_eui: match config.dev_eui.as_ref() {
            None => Some(DEF_DEV_EUI.to_string()),
            Some(eui) => Some(eui.clone()),
        },
        app_eui: match config.app_eui.as_ref() {
            None => Some(DEF_APP_EUI.to_string()),
            Some(eui) => Some(eui.clone()),
        },
        app_key: match config.app_key.as_ref() {
            None => Some(DEF_APP_KEY.to_string()),
            Some(key) => Some(key.clone()),
        },
        join_trials: Some(config.join_trials.unwrap_or(DEF_JOIN_TRIALS)),
        confirmed_retries: Some(config.confirmed_retries.unwrap_or(DEF_CONFIRMED_RETRIES)),
        adr: Some(config.adr.unwrap_or(DEF_ADR)),
        confirmed: Some(config.confirmed.unwrap_or(DEF_CONFIRMED)),
        port: Some(config.port.unwrap_or(DEF_PORT)),
        channel: Some(config.channel.unwrap_or(DEF_CHANNEL)),
        tx_interval: Some(config.tx_interval.unwrap_or(DEF_TX_INTERVAL)),
        backoff: Some(config.backoff.unwrap_or(DEF_BACKOFF)),
        tx_gap: Some(config.tx_gap.unwrap_or(DEF_TX_GAP)),
    }
}

/// Rejects values that `apply_default()` cannot fix, such as zero intervals from a config file.
pub fn check(config: &Config) -> Result<(), Box<dyn StdError>> {
    if config.tx_interval == Some(0) {
        return Err("`txInterval` must be positive".into());
    } else if config.backoff == Some(0) {
        return Err("`backoff` must be positive".into());
    }
    Ok(())
}

/// Decode the OTAA credentials. The configuration must be filled by [`apply_default()`].
pub fn connect_params(config: &Config) -> Result<ConnectParams, Box<dyn StdError>> {
    let mut params = ConnectParams {
        dev_eui: [0u8; 8],
        app_eui: [0u8; 8],
        app_key: [0u8; 16],
        nb_trials: config.join_trials.unwrap_or(DEF_JOIN_TRIALS),
    };
    decode_hex("devEui", config.dev_eui.as_deref(), &mut params.dev_eui)?;
    decode_hex("appEui", config.app_eui.as_deref(), &mut params.app_eui)?;
    decode_hex("appKey", config.app_key.as_deref(), &mut params.app_key)?;
    Ok(params)
}

pub fn stack_options(config: &Config) -> StackOptions {
    StackOptions {
        dev_path: config
            .dev_path
            .clone()
            .unwrap_or(DEF_DEV_PATH.to_string()),
        freq: config.freq.unwrap_or(DEF_FREQ),
        power: config.power.unwrap_or(DEF_POWER),
        tx_gap: Duration::from_millis(config.tx_gap.unwrap_or(DEF_TX_GAP)),
    }
}

pub fn uplink_options(config: &Config) -> UplinkOptions {
    UplinkOptions {
        port: config.port.unwrap_or(DEF_PORT),
        channel: config.channel.unwrap_or(DEF_CHANNEL),
        confirmed: config.confirmed.unwrap_or(DEF_CONFIRMED),
        steady_interval: Duration::from_millis(config.tx_interval.unwrap_or(DEF_TX_INTERVAL)),
        backoff: Duration::from_millis(config.backoff.unwrap_or(DEF_BACKOFF)),
    }
}

fn decode_hex(name: &str, value: Option<&str>, out: &mut [u8]) -> Result<(), Box<dyn StdError>> {
    let value = match value {
        None => return Err(format!("missing `{}`", name).into()),
        Some(value) => value,
    };
    if let Err(e) = hex::decode_to_slice(value, out) {
        return Err(format!("invalid `{}`: {}", name, e).into());
    }
    Ok(())
}

fn read_str(args: &ArgMatches, id: &str, env_name: &str) -> Option<String> {
    match args.get_one::<String>(id) {
        None => match env::var(env_name) {
            Err(_) => None,
            Ok(v) => Some(v),
        },
        Some(v) => Some(v.clone()),
    }
}

fn read_num<T: FromStr + TryFrom<i64>>(args: &ArgMatches, id: &str, env_name: &str) -> Option<T> {
    match args.get_one::<i64>(id) {
        None => match env::var(env_name) {
            Err(_) => None,
            Ok(v) => v.parse::<T>().ok(),
        },
        Some(v) => T::try_from(*v).ok(),
    }
}

fn read_bool(args: &ArgMatches, id: &str, env_name: &str) -> Option<bool> {
    match args.get_one::<bool>(id) {
        None => match env::var(env_name) {
            Err(_) => None,
            Ok(v) => v.parse::<bool>().ok(),
        },
        Some(v) => Some(*v),
    }
}
