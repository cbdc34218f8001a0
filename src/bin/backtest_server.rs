use std::env;
use std::sync::Mutex;

use actix_web::{web, App, HttpServer};
use backtesting::config::ServerConfig;
use backtesting::http::backtest::server::{alert_rules, results, run};
use backtesting::http::backtest::AppState;
use log::info;
use time::OffsetDateTime;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let config = ServerConfig::from_args(&args)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;

    let mut state = AppState::demo(OffsetDateTime::now_utc());
    state.polls_until_complete = config.polls_until_complete;

    let app_state = Mutex::new(state);
    let backtest_state = web::Data::new(app_state);

    info!("Serving backtests on {}:{}", config.address, config.port);
    HttpServer::new(move || {
        App::new()
            .app_data(backtest_state.clone())
            .service(run)
            .service(results)
            .service(alert_rules)
    })
    .bind((config.address, config.port))?
    .run()
    .await
}
