use crate::io_struct::ChatReqInput;
use crate::relay::{RelayConfig, RelayState};
use actix_web::{HttpRequest, HttpResponse, HttpServer, get, post, web};
use std::io::Write;

#[get("/health")]
pub async fn health(_req: HttpRequest, _: web::Data<RelayState>) -> HttpResponse {
    HttpResponse::Ok().body("Ok")
}

#[post("/api/chat")]
pub async fn chat(
    _req: HttpRequest,
    req: web::Json<ChatReqInput>,
    app_state: web::Data<RelayState>,
) -> Result<HttpResponse, actix_web::Error> {
    app_state.chat(req.into_inner()).await
}

pub async fn startup(config: RelayConfig, relay_state: RelayState) -> std::io::Result<()> {
    let app_state = web::Data::new(relay_state);

    println!("Starting server at {}:{}", config.host, config.port);

    // default level is info
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .init();

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .service(health)
            .service(chat)
    })
    .bind((config.host, config.port))?
    .run()
    .await?;

    std::io::Result::Ok(())
}
