// gateway/src/static_files.rs
use actix_files::{Files, NamedFile};
use actix_web::{web, Error, HttpRequest, HttpResponse, Result};
use std::path::{Path, PathBuf};

// Where the GUI build lives and which file boots it
#[derive(Clone)]
pub struct StaticFilesConfig {
    pub root_path: PathBuf,
    pub index_file: String,
}

impl StaticFilesConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            index_file: "index.html".to_string(),
        }
    }
}

// The GUI routes client-side, so unknown paths get the index file
async fn gui_index(req: HttpRequest, config: web::Data<StaticFilesConfig>) -> Result<HttpResponse, Error> {
    let path = req.path();
    if path.starts_with("/ws") || path.starts_with("/test/") {
        return Ok(HttpResponse::NotFound().finish());
    }

    let index_path = config.root_path.join(&config.index_file);
    let file = NamedFile::open_async(index_path).await?;
    Ok(file.into_response(&req))
}

/// Serve the GUI at `/`, falling back to its index file.
pub fn configure_gui(cfg: &mut web::ServiceConfig, config: StaticFilesConfig) {
    cfg.app_data(web::Data::new(config.clone())).service(
        Files::new("/", &config.root_path)
            .index_file(&config.index_file)
            .prefer_utf8(true)
            .use_etag(true)
            .use_last_modified(true)
            .default_handler(web::to(gui_index)),
    );
}

/// Serve the GUI test suite under `/test`.
pub fn configure_tests(cfg: &mut web::ServiceConfig, root: &Path) {
    cfg.service(Files::new("/test", root).index_file("index.html").use_etag(true));
}
