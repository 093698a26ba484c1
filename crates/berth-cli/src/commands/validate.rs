use super::{json_pretty, load_definition, EXIT_SUCCESS};
use berth_schema::definition_digest;
use std::path::PathBuf;

pub fn run(files: &[PathBuf], json: bool) -> Result<u8, String> {
    let mut report = Vec::with_capacity(files.len());
    for path in files {
        let definition = load_definition(path)?;
        let digest = definition_digest(&definition);
        if !json {
            println!(
                "ok  {}/{}  replicas={}  digest={}",
                definition.group(),
                definition.name(),
                definition.replicas(),
                digest.short()
            );
        }
        report.push(serde_json::json!({
            "file": path.display().to_string(),
            "group": definition.group(),
            "name": definition.name(),
            "replicas": definition.replicas(),
            "digest": digest,
        }));
    }
    if json {
        println!("{}", json_pretty(&report)?);
    }
    Ok(EXIT_SUCCESS)
}
