//! Ops Manager inventory: deployed products and the stemcells they run on.
//!
//! Joins `/api/v0/deployed/products` with `/api/v0/stemcell_assignments`
//! (by product GUID) into `opsman_products.csv`, and lists the stemcell
//! library into `opsman_stemcells.csv`, marking stemcells the diagnostic
//! report shows as deployed.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{info, info_span, warn, Instrument};

use crate::contract::ApiClient;
use crate::csv_sink::{CollectError, CsvRow, CsvSink};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductRecord {
    pub foundation: String,
    pub opsman_version: String,
    pub product_type: String,
    pub installation_name: String,
    pub guid: String,
    pub product_version: String,
    pub staged_version: String,
    pub deployed_stemcell: String,
    pub staged_stemcell: String,
    pub required_stemcell: String,
}

impl CsvRow for ProductRecord {
    const HEADERS: &'static [&'static str] = &[
        "foundation",
        "opsman_version",
        "product_type",
        "installation_name",
        "guid",
        "product_version",
        "staged_version",
        "deployed_stemcell",
        "staged_stemcell",
        "required_stemcell",
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StemcellRecord {
    pub foundation: String,
    pub os: String,
    pub version: String,
    pub infrastructure: String,
    pub filename: String,
    pub deployed: bool,
}

impl CsvRow for StemcellRecord {
    const HEADERS: &'static [&'static str] =
        &["foundation", "os", "version", "infrastructure", "filename", "deployed"];
}

#[derive(Debug, Clone, Serialize)]
pub struct OpsmanReport {
    pub foundation: String,
    pub opsman_version: String,
    pub files: BTreeMap<String, usize>,
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

fn array_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

async fn fetch<A>(client: &A, path: &str) -> Result<Value, CollectError>
where
    A: ApiClient + ?Sized,
{
    match client.get_json(path).await? {
        Some(doc) => Ok(doc),
        None => Ok(Value::Null),
    }
}

/// Stemcell versions of deployed products as `os/version` pairs, read from
/// the diagnostic report's `bosh-stemcell-<version>-<infra>-<os>-go_agent` names.
pub fn deployed_stemcells(report: &Value) -> BTreeSet<String> {
    array_at(report, "/added_products/deployed")
        .iter()
        .map(|p| str_at(p, "/stemcell"))
        .chain(array_at(report, "/stemcells").iter().filter_map(Value::as_str))
        .filter_map(stemcell_version)
        .collect()
}

/// `bosh-stemcell-621.77-vsphere-esxi-ubuntu-jammy-go_agent.tgz` → `621.77`.
pub fn stemcell_version(name: &str) -> Option<String> {
    let rest = name.strip_prefix("bosh-stemcell-").or_else(|| name.strip_prefix("light-bosh-stemcell-"))?;
    let version = rest.split('-').next()?;
    (!version.is_empty()).then(|| version.to_string())
}

pub async fn collect_opsman<A>(
    client: &A,
    foundation: &str,
    output_dir: &Path,
) -> Result<OpsmanReport, CollectError>
where
    A: ApiClient + ?Sized,
{
    let span = info_span!("opsman", foundation);
    async move {
        let info = fetch(client, "/api/v0/info").await?;
        let opsman_version = str_at(&info, "/info/version").to_string();
        info!(opsman_version = %opsman_version, "Ops Manager reachable");

        let products = fetch(client, "/api/v0/deployed/products").await?;
        let assignments = fetch(client, "/api/v0/stemcell_assignments").await?;
        let diagnostic = match fetch(client, "/api/v0/diagnostic_report").await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "Diagnostic report unavailable");
                Value::Null
            }
        };

        let by_guid: HashMap<&str, &Value> = array_at(&assignments, "/products")
            .iter()
            .map(|p| (str_at(p, "/guid"), p))
            .collect();

        let product_sink = CsvSink::<ProductRecord>::create(output_dir.join("opsman_products.csv"))?;
        for product in products.as_array().map(Vec::as_slice).unwrap_or(&[]) {
            let guid = str_at(product, "/guid");
            let assignment = by_guid.get(guid).copied().unwrap_or(&Value::Null);
            let required = match (
                str_at(assignment, "/required_stemcell_os"),
                str_at(assignment, "/required_stemcell_version"),
            ) {
                ("", v) => v.to_string(),
                (os, v) => format!("{os}/{v}"),
            };
            product_sink.append(&ProductRecord {
                foundation: foundation.to_string(),
                opsman_version: opsman_version.clone(),
                product_type: str_at(product, "/type").to_string(),
                installation_name: str_at(product, "/installation_name").to_string(),
                guid: guid.to_string(),
                product_version: str_at(product, "/product_version").to_string(),
                staged_version: str_at(assignment, "/staged_product_version").to_string(),
                deployed_stemcell: str_at(assignment, "/deployed_stemcell_version").to_string(),
                staged_stemcell: str_at(assignment, "/staged_stemcell_version").to_string(),
                required_stemcell: required,
            })?;
        }

        let deployed = deployed_stemcells(&diagnostic);
        let stemcell_sink = CsvSink::<StemcellRecord>::create(output_dir.join("opsman_stemcells.csv"))?;
        for stemcell in array_at(&assignments, "/stemcell_library") {
            let version = str_at(stemcell, "/version");
            stemcell_sink.append(&StemcellRecord {
                foundation: foundation.to_string(),
                os: str_at(stemcell, "/os").to_string(),
                version: version.to_string(),
                infrastructure: str_at(stemcell, "/infrastructure").to_string(),
                filename: str_at(stemcell, "/filename").to_string(),
                deployed: deployed.contains(version),
            })?;
        }

        let mut files = BTreeMap::new();
        files.insert("opsman_products.csv".to_string(), product_sink.finish()?);
        files.insert("opsman_stemcells.csv".to_string(), stemcell_sink.finish()?);
        info!(files = ?files, "Ops Manager inventory collected");
        Ok(OpsmanReport {
            foundation: foundation.to_string(),
            opsman_version,
            files,
        })
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockApiClient;
    use serde_json::json;

    #[test]
    fn stemcell_names_yield_versions() {
        assert_eq!(
            stemcell_version("bosh-stemcell-1.423-vsphere-esxi-ubuntu-jammy-go_agent.tgz").as_deref(),
            Some("1.423")
        );
        assert_eq!(stemcell_version("something-else"), None);
    }

    #[tokio::test]
    async fn products_join_their_stemcell_assignment() {
        let mut mock = MockApiClient::new();
        mock.expect_get_json().returning(|path| {
            Ok(Some(match path {
                "/api/v0/info" => json!({"info": {"version": "3.0.25"}}),
                "/api/v0/deployed/products" => json!([
                    {"installation_name": "cf-1a2b", "guid": "cf-1a2b", "type": "cf", "product_version": "4.0.10"},
                    {"installation_name": "p-bosh-9", "guid": "p-bosh-9", "type": "p-bosh", "product_version": "3.0.25"}
                ]),
                "/api/v0/stemcell_assignments" => json!({
                    "products": [{
                        "guid": "cf-1a2b",
                        "staged_product_version": "4.0.11",
                        "deployed_stemcell_version": "1.400",
                        "staged_stemcell_version": "1.423",
                        "required_stemcell_os": "ubuntu-jammy",
                        "required_stemcell_version": "1.351"
                    }],
                    "stemcell_library": [
                        {"os": "ubuntu-jammy", "version": "1.400", "infrastructure": "vsphere"},
                        {"os": "ubuntu-jammy", "version": "1.423", "infrastructure": "vsphere"}
                    ]
                }),
                "/api/v0/diagnostic_report" => json!({
                    "added_products": {"deployed": [
                        {"name": "cf", "version": "4.0.10", "stemcell": "bosh-stemcell-1.400-vsphere-esxi-ubuntu-jammy-go_agent.tgz"}
                    ]}
                }),
                other => panic!("unexpected path {other}"),
            }))
        });

        let dir = tempfile::tempdir().unwrap();
        let report = collect_opsman(&mock, "lab", dir.path()).await.unwrap();
        assert_eq!(report.opsman_version, "3.0.25");
        assert_eq!(report.files["opsman_products.csv"], 2);

        let mut reader = csv::Reader::from_path(dir.path().join("opsman_products.csv")).unwrap();
        let rows: Vec<ProductRecord> = reader
            .records()
            .map(|r| {
                let r = r.unwrap();
                ProductRecord {
                    foundation: r[0].into(),
                    opsman_version: r[1].into(),
                    product_type: r[2].into(),
                    installation_name: r[3].into(),
                    guid: r[4].into(),
                    product_version: r[5].into(),
                    staged_version: r[6].into(),
                    deployed_stemcell: r[7].into(),
                    staged_stemcell: r[8].into(),
                    required_stemcell: r[9].into(),
                }
            })
            .collect();
        assert_eq!(rows[0].deployed_stemcell, "1.400");
        assert_eq!(rows[0].required_stemcell, "ubuntu-jammy/1.351");
        assert_eq!(rows[1].staged_version, "");

        let stemcells = std::fs::read_to_string(dir.path().join("opsman_stemcells.csv")).unwrap();
        assert!(stemcells.contains("lab,ubuntu-jammy,1.400,vsphere,,true"));
        assert!(stemcells.contains("lab,ubuntu-jammy,1.423,vsphere,,false"));
    }
}
