#[macro_use]
extern crate log;

#[tokio::main]
async fn main() -> Result<(), rocket::Error> {
    pretty_env_logger::init();

    let app = match docseal::setup().await {
        Ok(app) => app,
        Err(err) => {
            error!("Unable to start: {}", err);
            std::process::exit(1);
        }
    };

    info!("DocSeal signing server starting...");

    app.rocket
        .launch()
        .await
        .map(|_| ())
}
