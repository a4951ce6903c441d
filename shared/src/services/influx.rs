use std::collections::BTreeMap;

use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::info;

use crate::utilities::{config::InfluxConfig, errors::AppError};

/// Bucket retention applied on lazy creation: 10 years.
pub const DEFAULT_RETENTION_SECONDS: i64 = 315_360_000;

// ============================================
// LINE PROTOCOL
// ============================================

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
}

/// One time-series point. Timestamps are assigned server-side on write.
#[derive(Clone, Debug)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
}

impl Point {
    pub fn new(measurement: &str) -> Self {
        Self {
            measurement: measurement.to_owned(),
            tags: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn tag(mut self, key: &str, value: impl ToString) -> Self {
        self.tags.push((key.to_owned(), value.to_string()));
        self
    }

    pub fn field_f64(mut self, key: &str, value: f64) -> Self {
        self.fields.push((key.to_owned(), FieldValue::Float(value)));
        self
    }

    pub fn field_i64(mut self, key: &str, value: i64) -> Self {
        self.fields.push((key.to_owned(), FieldValue::Integer(value)));
        self
    }

    pub fn field_str(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.push((key.to_owned(), FieldValue::Text(value.into())));
        self
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Render the point in line protocol. Tags with empty values are
    /// dropped; an empty tag value is not representable.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(&escape_tag(value));
        }
        line.push(' ');
        let rendered: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                let rendered_value = match value {
                    FieldValue::Float(v) => format!("{v}"),
                    FieldValue::Integer(v) => format!("{v}i"),
                    FieldValue::Text(v) => format!("\"{}\"", escape_string_field(v)),
                };
                format!("{}={}", escape_tag(key), rendered_value)
            })
            .collect();
        line.push_str(&rendered.join(","));
        line
    }
}

fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_string_field(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

// ============================================
// FLUX RESULTS
// ============================================

/// One Flux result table; consecutive CSV rows sharing a `table` index.
#[derive(Clone, Debug, Default)]
pub struct FluxTable {
    pub records: Vec<FluxRecord>,
}

#[derive(Clone, Debug, Default)]
pub struct FluxRecord {
    pub values: BTreeMap<String, Value>,
}

impl FluxRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }
}

/// Parse the CSV body returned by `/api/v2/query`. Annotation rows are
/// skipped; each blank-line separated chunk carries its own header; rows are
/// grouped into tables on the `table` index column. `_value` is parsed into
/// a JSON number when possible, every other column stays a string.
pub fn parse_flux_csv(body: &str) -> Result<Vec<FluxTable>, AppError> {
    let mut tables = Vec::new();

    for chunk in body.replace("\r\n", "\n").split("\n\n") {
        if chunk.trim().is_empty() {
            continue;
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(chunk.as_bytes());

        let mut header: Option<Vec<String>> = None;
        let mut current_table: Option<(i64, FluxTable)> = None;

        for row in reader.records() {
            let row = row.map_err(|err| AppError::InternalError(err.to_string()))?;
            let mut cells: Vec<String> = row.iter().map(str::to_owned).collect();
            if cells.first().map(|c| c.starts_with('#')).unwrap_or(false) {
                continue;
            }

            match &header {
                None => {
                    // The annotation column leaves a leading empty header cell.
                    if cells.first().map(String::is_empty).unwrap_or(false) {
                        cells.remove(0);
                    }
                    header = Some(cells);
                }
                Some(columns) => {
                    if cells.len() == columns.len() + 1
                        && cells.first().map(String::is_empty).unwrap_or(false)
                    {
                        cells.remove(0);
                    }
                    let mut record = FluxRecord::default();
                    for (column, cell) in columns.iter().zip(cells) {
                        let value = if column == "_value" {
                            parse_flux_value(&cell)
                        } else {
                            Value::String(cell)
                        };
                        record.values.insert(column.clone(), value);
                    }
                    let table_index = record
                        .get_str("table")
                        .and_then(|raw| raw.parse::<i64>().ok())
                        .unwrap_or(0);
                    match &mut current_table {
                        Some((index, table)) if *index == table_index => {
                            table.records.push(record);
                        }
                        _ => {
                            if let Some((_, table)) = current_table.take() {
                                tables.push(table);
                            }
                            current_table = Some((
                                table_index,
                                FluxTable {
                                    records: vec![record],
                                },
                            ));
                        }
                    }
                }
            }
        }

        if let Some((_, table)) = current_table.take() {
            tables.push(table);
        }
    }

    Ok(tables)
}

fn parse_flux_value(raw: &str) -> Value {
    if let Ok(value) = raw.parse::<i64>() {
        return json!(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        return json!(value);
    }
    Value::String(raw.to_owned())
}

// ============================================
// CLIENT
// ============================================

/// Minimal InfluxDB 2.x client over plain HTTP: line-protocol writes,
/// lazily created buckets and Flux queries.
pub struct Influx {
    http: reqwest::Client,
    base_url: String,
    org: String,
    token: String,
    org_id: OnceCell<String>,
}

impl Influx {
    pub fn new(config: &InfluxConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url(),
            org: config.org.clone(),
            token: config.token.clone(),
            org_id: OnceCell::new(),
        })
    }

    /// Client against an explicit endpoint, used by tests.
    pub fn with_endpoint(base_url: &str, org: &str, token: &str) -> Result<Self, AppError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            org: org.to_owned(),
            token: token.to_owned(),
            org_id: OnceCell::new(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    async fn org_id(&self) -> Result<&str, AppError> {
        self.org_id
            .get_or_try_init(|| async {
                let response = self
                    .http
                    .get(format!("{}/api/v2/orgs", self.base_url))
                    .header("Authorization", self.auth_header())
                    .query(&[("org", self.org.as_str())])
                    .send()
                    .await?;
                let body: Value = check_status(response).await?.json().await?;
                body["orgs"][0]["id"]
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        AppError::InternalError(format!("unknown organization '{}'", self.org))
                    })
            })
            .await
            .map(String::as_str)
    }

    /// Create the bucket with an expire retention rule unless it exists.
    pub async fn ensure_bucket(&self, name: &str, retention_seconds: i64) -> Result<(), AppError> {
        let response = self
            .http
            .get(format!("{}/api/v2/buckets", self.base_url))
            .header("Authorization", self.auth_header())
            .query(&[("name", name)])
            .send()
            .await?;

        if response.status().is_success() {
            let body: Value = response.json().await?;
            if body["buckets"].as_array().map(|b| !b.is_empty()).unwrap_or(false) {
                return Ok(());
            }
        }

        info!("Create bucket '{name}'");
        let org_id = self.org_id().await?;
        let response = self
            .http
            .post(format!("{}/api/v2/buckets", self.base_url))
            .header("Authorization", self.auth_header())
            .json(&json!({
                "orgID": org_id,
                "name": name,
                "retentionRules": [{"type": "expire", "everySeconds": retention_seconds}],
            }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn write(&self, bucket: &str, points: &[Point]) -> Result<(), AppError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points
            .iter()
            .filter(|point| point.has_fields())
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .http
            .post(format!("{}/api/v2/write", self.base_url))
            .header("Authorization", self.auth_header())
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", bucket),
                ("precision", "s"),
            ])
            .body(body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn query(&self, flux: &str) -> Result<Vec<FluxTable>, AppError> {
        let response = self
            .http
            .post(format!("{}/api/v2/query", self.base_url))
            .header("Authorization", self.auth_header())
            .header("Accept", "application/csv")
            .query(&[("org", self.org.as_str())])
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": {"header": true, "annotations": []},
            }))
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;
        parse_flux_csv(&body)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::InfluxApiError {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_protocol_escapes_tags_and_strings() {
        let point = Point::new("nodes")
            .tag("node_name", "worker 0")
            .tag("group", "general")
            .field_f64("node_boot_time_seconds", 12.5)
            .field_i64("node_total_running_pods", 3)
            .field_str("phase", "Run\"ning");
        assert_eq!(
            point.to_line_protocol(),
            "nodes,node_name=worker\\ 0,group=general \
             node_boot_time_seconds=12.5,node_total_running_pods=3i,phase=\"Run\\\"ning\""
        );
    }

    #[test]
    fn empty_tag_values_are_dropped() {
        let point = Point::new("serrano_deployments")
            .tag("group_id", "")
            .tag("deployment_uuid", "d-1")
            .field_i64("restarts", 0);
        assert_eq!(
            point.to_line_protocol(),
            "serrano_deployments,deployment_uuid=d-1 restarts=0i"
        );
    }

    #[test]
    fn parses_flux_csv_into_tables() {
        let body = "\
result,table,_time,_value,_field,node_name,node_cpus
_result,0,2023-01-01T00:00:00Z,1.5,cpu_0_idle,worker-0,2
_result,0,2023-01-01T00:01:00Z,1.7,cpu_0_idle,worker-0,2
_result,1,2023-01-01T00:00:00Z,42,cpu_0_used,worker-0,2
";
        let tables = parse_flux_csv(body).unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].records.len(), 2);
        assert_eq!(tables[0].records[0].get("_value"), Some(&json!(1.5)));
        assert_eq!(tables[1].records[0].get("_value"), Some(&json!(42)));
        assert_eq!(
            tables[1].records[0].get_str("node_name"),
            Some("worker-0")
        );
    }

    #[test]
    fn parses_annotated_chunks_with_leading_empty_column() {
        let body = "\
#datatype,string,long,dateTime:RFC3339,double,string,string
#group,false,false,false,false,true,true
#default,_result,,,,,
,result,table,_time,_value,_field,name
,_result,0,2023-01-01T00:00:00Z,100,capacity_storage,pv-1

#datatype,string,long,dateTime:RFC3339,double,string,string
#group,false,false,false,false,true,true
#default,_result,,,,,
,result,table,_time,_value,_field,name
,_result,1,2023-01-01T00:00:00Z,200,capacity_storage,pv-2
";
        let tables = parse_flux_csv(body).unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].records[0].get_str("name"), Some("pv-1"));
        assert_eq!(tables[1].records[0].get("_value"), Some(&json!(200)));
    }
}
