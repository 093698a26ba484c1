use super::{json_pretty, load_definition, EXIT_SUCCESS};
use berth_core::replicas;
use berth_schema::{Changelog, ContainerDefinition, ContainerKey};
use std::path::Path;

/// Show what applying `file` would change, given the previously applied
/// definition (if any) and the current highest replica index.
pub fn run(
    file: &Path,
    previous: Option<&Path>,
    highest: Option<u32>,
    json: bool,
) -> Result<u8, String> {
    let definition = load_definition(file)?;
    let previous = previous.map(load_definition).transpose()?;
    if let Some(previous) = &previous {
        if previous.group() != definition.group() || previous.name() != definition.name() {
            return Err(format!(
                "previous definition is {}/{}, not {}/{}",
                previous.group(),
                previous.name(),
                definition.group(),
                definition.name()
            ));
        }
    }

    let highest =
        highest.unwrap_or_else(|| previous.as_ref().map_or(0, ContainerDefinition::replicas));
    let changelog = Changelog::between(previous.as_ref(), &definition);
    let plan = replicas::plan(definition.replicas(), highest, &changelog);

    let group = definition.group();
    let name = definition.name();
    let create = plan.create_keys(group, name);
    let destroy = plan.destroy_keys(group, name);
    let update = plan.update_keys(group, name);

    if json {
        let payload = serde_json::json!({
            "group": group,
            "name": name,
            "changed": &changelog.changed,
            "replica_only": changelog.is_replica_only(),
            "previous_highest": plan.previous_highest,
            "create": create,
            "update": update,
            "destroy": destroy,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    if previous.is_none() {
        println!("{group}/{name}: first apply");
    } else if changelog.is_empty() {
        println!("{group}/{name}: no changes");
    } else {
        println!("{group}/{name}: changed {}", changelog.changed.join(", "));
    }
    print_keys("create", &create);
    print_keys("update", &update);
    print_keys("destroy", &destroy);
    if plan.is_empty() {
        println!("nothing to do");
    }
    Ok(EXIT_SUCCESS)
}

fn print_keys(action: &str, keys: &[ContainerKey]) {
    for key in keys {
        println!("  {action:<8} {key}");
    }
}
