use std::collections::HashMap;

use shared::schemas::{CpuSample, EdgeDeviceMetrics, NodeSample};

/// One sample from a Prometheus text exposition.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl Sample {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Parse a Prometheus text page into samples. Comment and malformed lines
/// are skipped; this only needs to understand the node-exporter and MinIO
/// expositions, not the whole format.
pub fn parse_metrics(text: &str) -> Vec<Sample> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Sample> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            let labels = parse_labels(&line[open + 1..close]);
            (line[..open].to_owned(), labels, &line[close + 1..])
        }
        None => {
            let name = line.split_whitespace().next()?;
            let rest = &line[name.len()..];
            (name.to_owned(), HashMap::new(), rest)
        }
    };

    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
    Some(Sample { name, labels, value })
}

fn parse_labels(body: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut chars = body.chars().peekable();

    loop {
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next().is_none() {
            break;
        }
        if chars.next() != Some('"') {
            break;
        }
        let mut value = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some(other) => value.push(other),
                    None => break,
                },
                '"' => break,
                other => value.push(other),
            }
        }
        labels.insert(key.trim().trim_matches(',').to_owned(), value);
        // skip the separating comma, if any
        if chars.peek() == Some(&',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
    }

    labels
}

const MEMORY_FAMILIES: [&str; 5] = [
    "node_memory_Buffers_bytes",
    "node_memory_Cached_bytes",
    "node_memory_MemAvailable_bytes",
    "node_memory_MemFree_bytes",
    "node_memory_MemTotal_bytes",
];

/// Aggregate one node-exporter page into a node sample: boot time, per-CPU
/// idle/used seconds, memory and root-filesystem families with derived
/// usage percentages, and interface-summed network counters.
pub fn node_sample_from_exporter(text: &str) -> NodeSample {
    let samples = parse_metrics(text);
    let mut node = NodeSample::default();
    let mut cpus: Vec<CpuSample> = Vec::new();
    let mut mem_total = None;
    let mut mem_free = None;
    let mut fs_size = None;
    let mut fs_free = None;

    for sample in &samples {
        match sample.name.as_str() {
            "node_boot_time_seconds" => node.node_boot_time_seconds = sample.value,
            "node_cpu_seconds_total" => {
                let Some(label) = sample.label("cpu") else {
                    continue;
                };
                let Ok(index) = label.parse::<usize>() else {
                    continue;
                };
                if cpus.len() <= index {
                    cpus.resize_with(index + 1, CpuSample::default);
                }
                cpus[index].label = label.to_owned();
                if sample.label("mode") == Some("idle") {
                    cpus[index].idle = sample.value;
                } else {
                    cpus[index].used += sample.value;
                }
            }
            name if MEMORY_FAMILIES.contains(&name) => {
                match name {
                    "node_memory_Buffers_bytes" => node.node_memory_buffers_bytes = sample.value,
                    "node_memory_Cached_bytes" => node.node_memory_cached_bytes = sample.value,
                    "node_memory_MemAvailable_bytes" => {
                        node.node_memory_mem_available_bytes = sample.value
                    }
                    "node_memory_MemFree_bytes" => {
                        node.node_memory_mem_free_bytes = sample.value;
                        mem_free = Some(sample.value);
                    }
                    "node_memory_MemTotal_bytes" => {
                        node.node_memory_mem_total_bytes = sample.value;
                        mem_total = Some(sample.value);
                    }
                    _ => {}
                }
            }
            "node_filesystem_size_bytes" | "node_filesystem_free_bytes"
            | "node_filesystem_avail_bytes" => {
                if sample.label("mountpoint") != Some("/") {
                    continue;
                }
                match sample.name.as_str() {
                    "node_filesystem_size_bytes" => {
                        node.node_filesystem_size_bytes = sample.value;
                        fs_size = Some(sample.value);
                    }
                    "node_filesystem_free_bytes" => {
                        node.node_filesystem_free_bytes = sample.value;
                        fs_free = Some(sample.value);
                    }
                    "node_filesystem_avail_bytes" => {
                        node.node_filesystem_avail_bytes = sample.value
                    }
                    _ => {}
                }
            }
            "node_network_receive_bytes_total" => {
                node.node_network_receive_bytes_total += sample.value
            }
            "node_network_receive_packets_total" => {
                node.node_network_receive_packets_total += sample.value
            }
            "node_network_receive_drop_total" => {
                node.node_network_receive_drop_total += sample.value
            }
            "node_network_receive_errs_total" => {
                node.node_network_receive_errs_total += sample.value
            }
            "node_network_transmit_bytes_total" => {
                node.node_network_transmit_bytes_total += sample.value
            }
            "node_network_transmit_packets_total" => {
                node.node_network_transmit_packets_total += sample.value
            }
            "node_network_transmit_drop_total" => {
                node.node_network_transmit_drop_total += sample.value
            }
            "node_network_transmit_errs_total" => {
                node.node_network_transmit_errs_total += sample.value
            }
            _ => {}
        }
    }

    if let (Some(total), Some(free)) = (mem_total, mem_free) {
        if total > 0.0 {
            node.node_memory_mem_used_bytes = total - free;
            node.node_memory_usage_percentage =
                round2(node.node_memory_mem_used_bytes / total * 100.0);
        }
    }
    if let (Some(size), Some(free)) = (fs_size, fs_free) {
        if size > 0.0 {
            node.node_filesystem_used_bytes = size - free;
            node.node_filesystem_usage_percentage =
                round2(node.node_filesystem_used_bytes / size * 100.0);
        }
    }

    node.node_cpus = cpus;
    node
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Sum the samples of each known MinIO family into the fixed counter set.
pub fn edge_metrics_from_text(text: &str) -> EdgeDeviceMetrics {
    let mut metrics = EdgeDeviceMetrics::default();
    for sample in parse_metrics(text) {
        let slot = match sample.name.as_str() {
            "minio_node_process_uptime_seconds" => &mut metrics.minio_node_process_uptime_seconds,
            "minio_bucket_usage_object_total" => &mut metrics.minio_bucket_usage_object_total,
            "minio_bucket_usage_total_bytes" => &mut metrics.minio_bucket_usage_total_bytes,
            "minio_node_disk_total_bytes" => &mut metrics.minio_node_disk_total_bytes,
            "minio_node_disk_free_bytes" => &mut metrics.minio_node_disk_free_bytes,
            "minio_node_disk_used_bytes" => &mut metrics.minio_node_disk_used_bytes,
            "minio_node_process_cpu_total_seconds" => {
                &mut metrics.minio_node_process_cpu_total_seconds
            }
            "minio_node_process_resident_memory_bytes" => {
                &mut metrics.minio_node_process_resident_memory_bytes
            }
            "minio_s3_requests_total" => &mut metrics.minio_s3_requests_total,
            "minio_s3_requests_errors_total" => &mut metrics.minio_s3_requests_errors_total,
            "minio_s3_requests_waiting_total" => &mut metrics.minio_s3_requests_waiting_total,
            "minio_s3_requests_rejected_invalid_total" => {
                &mut metrics.minio_s3_requests_rejected_invalid_total
            }
            "minio_s3_traffic_received_bytes" => &mut metrics.minio_s3_traffic_received_bytes,
            "minio_s3_traffic_sent_bytes" => &mut metrics.minio_s3_traffic_sent_bytes,
            _ => continue,
        };
        *slot += sample.value;
    }
    metrics
}

/// Sum of every sample of one family, for single-counter lookups.
pub fn family_total(text: &str, family: &str) -> f64 {
    parse_metrics(text)
        .iter()
        .filter(|sample| sample.name == family)
        .map(|sample| sample.value)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORTER_PAGE: &str = r#"
# HELP node_boot_time_seconds Node boot time, in unixtime.
# TYPE node_boot_time_seconds gauge
node_boot_time_seconds 1.690e+09
node_cpu_seconds_total{cpu="0",mode="idle"} 100.0
node_cpu_seconds_total{cpu="0",mode="user"} 20.0
node_cpu_seconds_total{cpu="0",mode="system"} 5.0
node_cpu_seconds_total{cpu="1",mode="idle"} 90.0
node_cpu_seconds_total{cpu="1",mode="user"} 30.0
node_memory_MemTotal_bytes 1000.0
node_memory_MemFree_bytes 400.0
node_memory_Buffers_bytes 10.0
node_memory_Cached_bytes 20.0
node_memory_MemAvailable_bytes 600.0
node_filesystem_size_bytes{mountpoint="/"} 2000.0
node_filesystem_free_bytes{mountpoint="/"} 500.0
node_filesystem_avail_bytes{mountpoint="/"} 450.0
node_filesystem_size_bytes{mountpoint="/boot"} 100.0
node_network_receive_bytes_total{device="eth0"} 10.0
node_network_receive_bytes_total{device="eth1"} 15.0
node_network_transmit_errs_total{device="eth0"} 2.0
"#;

    #[test]
    fn parses_names_labels_and_values() {
        let samples = parse_metrics("metric{a=\"x,y\",b=\"z\"} 4.5\nplain 7");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "metric");
        assert_eq!(samples[0].label("a"), Some("x,y"));
        assert_eq!(samples[0].label("b"), Some("z"));
        assert_eq!(samples[0].value, 4.5);
        assert_eq!(samples[1].name, "plain");
        assert_eq!(samples[1].value, 7.0);
    }

    #[test]
    fn aggregates_node_exporter_page() {
        let node = node_sample_from_exporter(EXPORTER_PAGE);

        assert_eq!(node.node_boot_time_seconds, 1.690e9);
        assert_eq!(node.node_cpus.len(), 2);
        assert_eq!(node.node_cpus[0].idle, 100.0);
        assert_eq!(node.node_cpus[0].used, 25.0);
        assert_eq!(node.node_cpus[1].label, "1");
        assert_eq!(node.node_cpus[1].used, 30.0);

        assert_eq!(node.node_memory_mem_used_bytes, 600.0);
        assert_eq!(node.node_memory_usage_percentage, 60.0);

        // only the root mountpoint counts
        assert_eq!(node.node_filesystem_size_bytes, 2000.0);
        assert_eq!(node.node_filesystem_used_bytes, 1500.0);
        assert_eq!(node.node_filesystem_usage_percentage, 75.0);

        assert_eq!(node.node_network_receive_bytes_total, 25.0);
        assert_eq!(node.node_network_transmit_errs_total, 2.0);
    }

    #[test]
    fn sums_minio_families() {
        let page = r#"
minio_node_disk_total_bytes{server="a"} 100
minio_node_disk_total_bytes{server="b"} 200
minio_s3_requests_total{api="getobject"} 5
minio_s3_requests_total{api="putobject"} 7
minio_unknown_metric 99
"#;
        let metrics = edge_metrics_from_text(page);
        assert_eq!(metrics.minio_node_disk_total_bytes, 300.0);
        assert_eq!(metrics.minio_s3_requests_total, 12.0);
        assert_eq!(metrics.minio_bucket_usage_total_bytes, 0.0);
        assert_eq!(family_total(page, "minio_node_disk_total_bytes"), 300.0);
    }
}
