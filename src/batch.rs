use crate::config::NstConfig;
use anyhow::{ensure, Context, Result};
use redis::{Commands, Connection};
use serde_json::{Map, Value};

/// Opens a Redis connection.
///
/// The connection is created once per command and passed by reference to the
/// queue operations.
///
/// **Errors**
///
/// Returns an error if the server is unreachable.
pub fn connect(host: &str, port: u16) -> Result<Connection> {
    let client = redis::Client::open((host, port))
        .with_context(|| format!("invalid redis address {host}:{port}"))?;
    client
        .get_connection()
        .with_context(|| format!("failed to connect to redis at {host}:{port}"))
}

/// Pops configs from the list `name` and runs each until the list is empty.
///
/// Returns the number of runs performed. An empty queue terminates the
/// worker rather than blocking.
///
/// **Errors**
///
/// Returns an error on a queue failure, an unparseable payload, or a failed
/// run.
pub fn process_from_queue(connection: &mut Connection, name: &str) -> Result<usize> {
    let mut processed = 0;
    while let Some(payload) = connection.lpop::<_, Option<String>>(name, None)? {
        let config: NstConfig =
            serde_json::from_str(&payload).context("unparseable config on queue")?;
        crate::run::run(&config)?;
        processed += 1;
        tracing::info!(processed, "trial finished");
    }
    tracing::info!(processed, "queue empty, worker terminating");
    Ok(processed)
}

/// Expands `grid` and pushes one config per grid point onto the list `name`.
///
/// Returns the queue length after the push.
///
/// **Errors**
///
/// Returns an error if the grid is malformed, a grid point is not a valid
/// config, or the push fails.
pub fn send_to_queue(connection: &mut Connection, name: &str, grid: &Map<String, Value>) -> Result<usize> {
    let mut payloads = Vec::new();
    for point in parameter_grid(grid)? {
        let config: NstConfig = serde_json::from_value(Value::Object(point))
            .context("grid point is not a valid config")?;
        payloads.push(serde_json::to_string(&config)?);
    }
    let length: usize = connection.lpush(name, payloads)?;
    Ok(length)
}

/// Flushes the queue database.
///
/// **Errors**
///
/// Returns an error if the command fails.
pub fn flush(connection: &mut Connection) -> Result<()> {
    redis::cmd("FLUSHDB")
        .query::<()>(connection)
        .context("failed to flush")
}

/// The cartesian product of a parameter grid: each key maps to an array of
/// candidate values, and each point picks one value per key. Keys are
/// iterated in sorted order so the expansion is reproducible.
///
/// An empty grid yields a single empty point.
///
/// **Errors**
///
/// Returns an error if any value is not an array.
pub fn parameter_grid(grid: &Map<String, Value>) -> Result<Vec<Map<String, Value>>> {
    let mut items: Vec<(&String, &Vec<Value>)> = Vec::with_capacity(grid.len());
    for (key, values) in grid.iter() {
        let values = values
            .as_array()
            .with_context(|| format!("grid value for {key:?} is not an array"))?;
        ensure!(!values.is_empty(), "grid value for {key:?} is empty");
        items.push((key, values));
    }
    items.sort_by_key(|(key, _)| key.as_str());
    let mut points = vec![Map::new()];
    for (key, values) in items {
        let mut expanded = Vec::with_capacity(points.len() * values.len());
        for point in points.iter() {
            for value in values.iter() {
                let mut point = point.clone();
                point.insert(key.clone(), value.clone());
                expanded.push(point);
            }
        }
        points = expanded;
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn grid_expands_cartesian_product() {
        let grid = json!({
            "model": ["vgg19", "vgg16"],
            "epochs": [100, 200, 300],
        });
        let points = parameter_grid(grid.as_object().unwrap()).unwrap();
        assert_eq!(points.len(), 6);
        assert_eq!(points[0]["epochs"], json!(100));
        assert_eq!(points[0]["model"], json!("vgg19"));
        assert_eq!(points[5]["epochs"], json!(300));
        assert_eq!(points[5]["model"], json!("vgg16"));
    }

    #[test]
    fn grid_iterates_keys_in_sorted_order() {
        let grid = json!({
            "zeta": [1],
            "alpha": [1, 2],
        });
        let points = parameter_grid(grid.as_object().unwrap()).unwrap();
        assert_eq!(points.len(), 2);
        // alpha is the fastest-varying key once sorted first
        assert_eq!(points[0]["alpha"], json!(1));
        assert_eq!(points[1]["alpha"], json!(2));
    }

    #[test]
    fn empty_grid_yields_one_empty_point() {
        let points = parameter_grid(&Map::new()).unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].is_empty());
    }

    #[test]
    fn non_array_value_rejected() {
        let grid = json!({ "model": "vgg19" });
        assert!(parameter_grid(grid.as_object().unwrap()).is_err());
    }

    #[test]
    fn grid_points_parse_as_configs() {
        let grid = json!({
            "model": ["vgg19"],
            "style_img": ["style.png"],
            "epochs": [10, 20],
        });
        for point in parameter_grid(grid.as_object().unwrap()).unwrap() {
            let config: NstConfig = serde_json::from_value(Value::Object(point)).unwrap();
            assert_eq!(config.model, "vgg19");
        }
    }
}
