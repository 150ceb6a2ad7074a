use crate::error::CoreError;

/// One round trip collecting everything the status bar shows. Each line is
/// `KEY:value`; CPU is reported as usage (100 - idle).
pub const BATCH_SCRIPT: &str = r#"echo "CPU_USAGE:$(top -bn1 | awk '/Cpu\(s\)/ {for (i = 1; i <= NF; i++) if ($i ~ /^id,?$/) {printf "%.1f", 100 - $(i-1); exit}}')"
echo "MEMORY_USAGE:$(free | awk '/^Mem:/ {printf "%.1f", $3 / $2 * 100}')"
echo "DISK_USAGE:$(df -P / | awk 'NR == 2 {gsub("%", "", $5); print $5}')"
echo "NETWORK_DATA:$(awk 'NR > 2 && $1 !~ /^lo:/ {sub(/:/, " "); print $2, $10; exit}' /proc/net/dev)"
echo "LOAD_AVG:$(awk '{print $1, $2, $3}' /proc/loadavg)"
echo "PROCESS_COUNT:$(ps -e --no-headers | wc -l)"
echo "TIMESTAMP:$(date +%s)""#;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadAverage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SystemMetrics {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    /// Cumulative received bytes of the first non-loopback interface.
    pub network_down: u64,
    pub network_up: u64,
    pub process_count: u32,
    pub load_average: LoadAverage,
    pub timestamp: i64,
}

/// Parses the batch script output. Unknown keys and malformed values are
/// skipped; output without a single recognised key is an error.
pub fn parse_batch_output(output: &str) -> Result<SystemMetrics, CoreError> {
    let mut metrics = SystemMetrics::default();
    let mut recognised = 0usize;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        let parsed = match key.trim() {
            "CPU_USAGE" => value.parse::<f64>().map(|v| metrics.cpu = v).is_ok(),
            "MEMORY_USAGE" => value.parse::<f64>().map(|v| metrics.memory = v).is_ok(),
            "DISK_USAGE" => value.parse::<f64>().map(|v| metrics.disk = v).is_ok(),
            "NETWORK_DATA" => {
                let mut parts = value.split_whitespace().map(str::parse::<u64>);
                match (parts.next(), parts.next()) {
                    (Some(Ok(down)), Some(Ok(up))) => {
                        metrics.network_down = down;
                        metrics.network_up = up;
                        true
                    }
                    _ => false,
                }
            }
            "LOAD_AVG" => {
                let loads: Vec<f64> = value
                    .split_whitespace()
                    .filter_map(|v| v.parse().ok())
                    .collect();
                if let &[load1, load5, load15] = loads.as_slice() {
                    metrics.load_average = LoadAverage {
                        load1,
                        load5,
                        load15,
                    };
                    true
                } else {
                    false
                }
            }
            "PROCESS_COUNT" => value.parse::<u32>().map(|v| metrics.process_count = v).is_ok(),
            "TIMESTAMP" => value.parse::<i64>().map(|v| metrics.timestamp = v).is_ok(),
            _ => false,
        };
        if parsed {
            recognised += 1;
        }
    }

    if recognised == 0 {
        return Err(CoreError::Invalid(
            "diagnostic output contained no metrics".to_string(),
        ));
    }
    Ok(metrics)
}
