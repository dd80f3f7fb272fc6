use anyhow::Result;
use clap::{Arg, Command};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use stockmeta::batch::{BatchRunner, ImageSource, TokioPacer};
use stockmeta::client::{mime_type_for_extension, GeminiClient};
use stockmeta::config::Config;
use stockmeta::credentials::{parse_credential_list, CredentialStore};
use stockmeta::export;
use stockmeta::resolver::ModelResolver;
use stockmeta::store::ResultStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("stockmeta=info,warn")
        .init();

    let matches = cli().get_matches();
    let output = PathBuf::from(matches.get_one::<String>("output").unwrap());

    let mut config = Config::load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });
    if let Some(state_dir) = matches.get_one::<String>("state-dir") {
        config.storage.state_dir = PathBuf::from(state_dir);
    }
    config.validate()?;

    let state_dir = config.storage.state_dir.clone();
    tokio::fs::create_dir_all(&state_dir).await?;

    let credential_store = CredentialStore::new(state_dir.clone());
    let raw_credentials = match matches.get_one::<String>("credentials") {
        Some(raw) => raw.clone(),
        None => credential_store.load().await.unwrap_or_default(),
    };

    let credentials = parse_credential_list(&raw_credentials);
    if credentials.is_empty() {
        error!("No credentials configured. Pass --credentials or save one first.");
        return Err(anyhow::anyhow!("no credentials configured"));
    }
    for credential in &credentials {
        CredentialStore::validate_format(credential, &config.validation)?;
    }

    if matches.get_flag("save-credentials") {
        credential_store.save(&raw_credentials).await?;
        info!("Credentials saved for later runs");
    }

    let resolver = ModelResolver::new(config.api.clone(), state_dir.clone())?;
    let client = Arc::new(GeminiClient::new(config.api.clone())?);

    if matches.get_flag("test") {
        match CredentialStore::test_connectivity(&credentials[0], &resolver, client.as_ref()).await
        {
            Ok(display_name) => {
                info!("Credential works; resolved model: {}", display_name);
                return Ok(());
            }
            Err(e) => {
                error!("Connectivity test failed: {}", e);
                return Err(e.into());
            }
        }
    }

    let image_dir = matches
        .get_one::<String>("image-dir")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("--image-dir is required"))?;
    if !image_dir.exists() {
        error!("Image directory does not exist: {}", image_dir.display());
        return Err(anyhow::anyhow!("image directory not found"));
    }

    let mut store = ResultStore::load(state_dir, config.storage.keep_previews).await;
    let mut images: HashMap<String, ImageSource> = HashMap::new();

    for entry in WalkDir::new(&image_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let mime_type = match path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(mime_type_for_extension)
        {
            Some(mime) => mime,
            None => continue,
        };

        let filename = entry.file_name().to_string_lossy().to_string();
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len() as u64;

        // Duplicate filenames from a previous run resume as existing rows
        let row_id = match store.add_row(filename.clone(), size, None) {
            Ok(row) => row.id.clone(),
            Err(_) => match store.rows().iter().find(|r| r.filename == filename) {
                Some(row) => row.id.clone(),
                None => continue,
            },
        };

        images.insert(
            row_id,
            ImageSource {
                bytes,
                mime_type: mime_type.to_string(),
            },
        );
    }

    let row_ids = store.generatable_ids();
    if row_ids.is_empty() {
        info!("Nothing to generate; all rows already settled");
    } else {
        let model = resolver.resolve(&credentials[0]).await?;
        info!(
            "Using model {} ({})",
            model.model_id, model.display_name
        );

        let pacer = Arc::new(TokioPacer::new(&config.pacing));
        let runner = BatchRunner::new(client, pacer, config.validation.clone()).with_progress(
            Box::new(|p| {
                if p.total > 0 {
                    info!(
                        "Progress: {}/{} done, {} failed, {} in flight",
                        p.completed + p.failed,
                        p.total,
                        p.failed,
                        p.in_progress
                    );
                }
            }),
        );

        let summary = runner
            .run(&mut store, &row_ids, &images, &credentials, &model)
            .await?;

        info!(
            "Batch complete: {} succeeded, {} failed out of {}",
            summary.succeeded, summary.failed, summary.total
        );
        if summary.quota_exhausted > 0 {
            warn!(
                "{} row(s) failed because every credential hit its quota; try again later or add credentials",
                summary.quota_exhausted
            );
        }
        if summary.cancelled {
            warn!("Batch was cancelled before finishing");
        }
    }

    let exported = export::write_csv(&store, &output).await?;
    info!("Wrote {} rows to {}", exported, output.display());

    Ok(())
}

fn cli() -> Command {
    Command::new("stockmeta")
        .version("0.1.0")
        .about("Batch stock-photo metadata generation via a generative vision API")
        .arg(
            Arg::new("image-dir")
                .short('d')
                .long("image-dir")
                .value_name("DIR")
                .help("Directory containing images to process")
                .required_unless_present("test"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output CSV path")
                .default_value("./metadata.csv"),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .value_name("DIR")
                .help("Directory for persisted rows, credentials, and model cache"),
        )
        .arg(
            Arg::new("credentials")
                .short('k')
                .long("credentials")
                .value_name("KEYS")
                .help("API credential(s), comma or newline separated; falls back to the stored value"),
        )
        .arg(
            Arg::new("save-credentials")
                .long("save-credentials")
                .help("Persist the supplied credentials for later runs")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test")
                .long("test")
                .help("Only test credential connectivity, process nothing")
                .action(clap::ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::cli;

    #[test]
    fn test_connectivity_mode_does_not_require_image_dir() {
        assert!(cli()
            .try_get_matches_from(["stockmeta", "--test", "-k", "key"])
            .is_ok());
        assert!(cli()
            .try_get_matches_from(["stockmeta", "-d", "./photos"])
            .is_ok());
        assert!(cli().try_get_matches_from(["stockmeta"]).is_err());
    }
}
