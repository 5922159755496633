use std::{error::Error as StdError, fs, process::ExitCode};

use clap::{Arg as ClapArg, Command};
use log::{self, error, info};
use serde::Deserialize;
use sylvia_iot_sdk::util::logger;
use tokio;

use uplink_demo::libs::{
    self, Task,
    app::App,
    config::{self, SENSOR_SIM},
    dispatcher::Dispatcher,
    lora_task::IfroglabStack,
    sensor::{Sensor, Shtc3, SimSensor},
    stack::Stack,
};

#[derive(Deserialize)]
struct AppConfig {
    log: logger::Config,
    #[serde(rename = "uplinkDemo")]
    uplink_demo: libs::config::Config,
}

const PROJ_NAME: &'static str = env!("CARGO_PKG_NAME");
const PROJ_VER: &'static str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    const FN_NAME: &'static str = "main";

    let conf = match init_config() {
        Err(e) => {
            let conf = &logger::Config {
                ..Default::default()
            };
            logger::init(PROJ_NAME, &conf);
            error!("[{}] read config error: {}", FN_NAME, e);
            return ExitCode::FAILURE;
        }
        Ok(conf) => conf,
    };

    logger::init(PROJ_NAME, &conf.log);

    let conf = config::apply_default(&conf.uplink_demo);
    if let Err(e) = config::check(&conf) {
        error!("[{}] config error: {}", FN_NAME, e);
        return ExitCode::FAILURE;
    }
    let params = match config::connect_params(&conf) {
        Err(e) => {
            error!("[{}] read credentials error: {}", FN_NAME, e);
            return ExitCode::FAILURE;
        }
        Ok(params) => params,
    };
    let sensor: Box<dyn Sensor> = match conf.sensor.as_deref() {
        Some(SENSOR_SIM) => Box::new(SimSensor::new()),
        _ => {
            let path = conf.i2c_path.as_deref().unwrap_or(config::DEF_I2C_PATH);
            match Shtc3::new(path) {
                Err(e) => {
                    error!("[{}] new sensor error: {}", FN_NAME, e);
                    return ExitCode::FAILURE;
                }
                Ok(sensor) => Box::new(sensor),
            }
        }
    };

    let mut dispatcher = Dispatcher::<Task>::new();
    let mut stack = IfroglabStack::new(config::stack_options(&conf));
    if let Err(e) = stack.initialize(dispatcher.poster()) {
        error!("[{}] LoRa initialization failed: {}", FN_NAME, e);
        return ExitCode::FAILURE;
    }
    info!("[{}] LoRa stack initialized", FN_NAME);

    let retries = conf.confirmed_retries.unwrap_or(config::DEF_CONFIRMED_RETRIES);
    if let Err(e) = stack.set_confirmed_msg_retries(retries) {
        error!("[{}] set_confirmed_msg_retries failed: {}", FN_NAME, e);
        return ExitCode::FAILURE;
    }

    let adr = conf.adr.unwrap_or(config::DEF_ADR);
    if let Err(e) = stack.set_adaptive_datarate(adr) {
        error!("[{}] set_adaptive_datarate({}) failed: {}", FN_NAME, adr, e);
        return ExitCode::FAILURE;
    }
    info!(
        "[{}] adaptive data rate (ADR) {}",
        FN_NAME,
        match adr {
            false => "disabled",
            true => "enabled",
        }
    );

    let mut app = App::new(sensor, stack, config::uplink_options(&conf));
    if let Err(e) = app.connect(&params) {
        error!("[{}] connection error: {}, code: {}", FN_NAME, e, e.code());
        return ExitCode::FAILURE;
    }

    dispatcher.run_forever(&mut app).await;

    match app.join_failed() {
        false => ExitCode::SUCCESS,
        true => ExitCode::FAILURE,
    }
}

fn init_config() -> Result<AppConfig, Box<dyn StdError>> {
    let mut args = Command::new(PROJ_NAME).version(PROJ_VER).arg(
        ClapArg::new("file")
            .short('f')
            .long("file")
            .help("config file")
            .num_args(1),
    );
    args = logger::reg_args(args);
    args = libs::config::reg_args(args);
    let args = args.get_matches();

    if let Some(v) = args.get_one::<String>("file") {
        let conf_str = fs::read_to_string(v)?;
        return Ok(json5::from_str(conf_str.as_str())?);
    }

    Ok(AppConfig {
        log: logger::read_args(&args),
        uplink_demo: libs::config::read_args(&args),
    })
}
