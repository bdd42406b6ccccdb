//! # inventory: flatten one Cloud Foundry foundation into CSV
//!
//! Collection runs in three stages:
//!
//! 1. Bulk loads: organizations, spaces, plans, offerings, brokers and users
//!    go into [`Lookups`]; processes, routes, service instances, bindings and
//!    roles are indexed by the GUID they hang off.
//! 2. Per-app fan-out: one worker per app (bounded by `workers`) fetches the
//!    current droplet and, in multi mode, the credential details of every
//!    binding, then appends its rows to the shared sinks.
//! 3. Foundation-wide tables: services, developers, audit events and
//!    buildpacks are written sequentially.
//!
//! In [`OutputMode::Single`] only `inventory.csv` is produced: one row per
//! app with bound services and space developers joined into columns.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::api::{list_path, paginate};
use crate::cache::{relationship_guid, LookupCache};
use crate::config::{CollectorSettings, OutputMode};
use crate::contract::{ApiClient, ApiError};
use crate::csv_sink::{CollectError, CsvRow, CsvSink};

/// Placeholder written instead of binding credentials when redaction is on.
pub const REDACTED: &str = "[REDACTED]";

/// Roles listed in the developers table.
const ROLE_TYPES: &[&str] = &[
    "organization_manager",
    "organization_auditor",
    "organization_billing_manager",
    "space_manager",
    "space_developer",
    "space_auditor",
    "space_supporter",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppRecord {
    pub foundation: String,
    pub org: String,
    pub space: String,
    pub app: String,
    pub app_guid: String,
    pub state: String,
    pub lifecycle: String,
    pub buildpacks: String,
    pub detected_buildpack: String,
    pub buildpack_versions: String,
    pub stack: String,
    pub jre_version: String,
    pub instances: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub routes: String,
    pub created_at: String,
    pub updated_at: String,
}

impl CsvRow for AppRecord {
    const HEADERS: &'static [&'static str] = &[
        "foundation",
        "org",
        "space",
        "app",
        "app_guid",
        "state",
        "lifecycle",
        "buildpacks",
        "detected_buildpack",
        "buildpack_versions",
        "stack",
        "jre_version",
        "instances",
        "memory_mb",
        "disk_mb",
        "routes",
        "created_at",
        "updated_at",
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceRecord {
    pub foundation: String,
    pub org: String,
    pub space: String,
    pub service_instance: String,
    pub service_instance_guid: String,
    pub kind: String,
    pub offering: String,
    pub plan: String,
    pub broker: String,
    pub bound_apps: usize,
    pub created_at: String,
}

impl CsvRow for ServiceRecord {
    const HEADERS: &'static [&'static str] = &[
        "foundation",
        "org",
        "space",
        "service_instance",
        "service_instance_guid",
        "type",
        "offering",
        "plan",
        "broker",
        "bound_apps",
        "created_at",
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BindingRecord {
    pub foundation: String,
    pub org: String,
    pub space: String,
    pub app: String,
    pub app_guid: String,
    pub service_instance: String,
    pub binding_name: String,
    pub binding_guid: String,
    pub credential_keys: String,
    pub credentials: String,
}

impl CsvRow for BindingRecord {
    const HEADERS: &'static [&'static str] = &[
        "foundation",
        "org",
        "space",
        "app",
        "app_guid",
        "service_instance",
        "binding_name",
        "binding_guid",
        "credential_keys",
        "credentials",
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeveloperRecord {
    pub foundation: String,
    pub org: String,
    pub space: String,
    pub username: String,
    pub user_guid: String,
    pub role: String,
}

impl CsvRow for DeveloperRecord {
    const HEADERS: &'static [&'static str] =
        &["foundation", "org", "space", "username", "user_guid", "role"];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditEventRecord {
    pub foundation: String,
    pub created_at: String,
    pub event_type: String,
    pub actor_type: String,
    pub actor: String,
    pub target_type: String,
    pub target: String,
    pub org: String,
    pub space: String,
}

impl CsvRow for AuditEventRecord {
    const HEADERS: &'static [&'static str] = &[
        "foundation",
        "created_at",
        "type",
        "actor_type",
        "actor",
        "target_type",
        "target",
        "org",
        "space",
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildpackRecord {
    pub foundation: String,
    pub name: String,
    pub stack: String,
    pub position: i64,
    pub enabled: bool,
    pub locked: bool,
    pub filename: String,
    pub state: String,
    pub updated_at: String,
}

impl CsvRow for BuildpackRecord {
    const HEADERS: &'static [&'static str] = &[
        "foundation",
        "name",
        "stack",
        "position",
        "enabled",
        "locked",
        "filename",
        "state",
        "updated_at",
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StackRecord {
    pub foundation: String,
    pub name: String,
    pub description: String,
    pub default: bool,
    /// Apps whose lifecycle names this stack.
    pub apps: usize,
}

impl CsvRow for StackRecord {
    const HEADERS: &'static [&'static str] = &["foundation", "name", "description", "default", "apps"];
}

/// One row of the single-file inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InventoryRow {
    pub foundation: String,
    pub org: String,
    pub space: String,
    pub app: String,
    pub app_guid: String,
    pub state: String,
    pub buildpacks: String,
    pub stack: String,
    pub jre_version: String,
    pub instances: u64,
    pub memory_mb: u64,
    pub routes: String,
    pub services: String,
    pub developers: String,
}

impl CsvRow for InventoryRow {
    const HEADERS: &'static [&'static str] = &[
        "foundation",
        "org",
        "space",
        "app",
        "app_guid",
        "state",
        "buildpacks",
        "stack",
        "jre_version",
        "instances",
        "memory_mb",
        "routes",
        "services",
        "developers",
    ];
}

/// Rows written per output file.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryReport {
    pub foundation: String,
    pub mode: OutputMode,
    pub apps: usize,
    pub files: BTreeMap<String, usize>,
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

fn u64_at(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

/// Shared lookup caches for one run.
#[derive(Debug)]
pub struct Lookups {
    pub organizations: LookupCache,
    pub spaces: LookupCache,
    pub service_plans: LookupCache,
    pub service_offerings: LookupCache,
    pub service_brokers: LookupCache,
    pub users: LookupCache,
}

impl Default for Lookups {
    fn default() -> Self {
        Self {
            organizations: LookupCache::new("/v3/organizations"),
            spaces: LookupCache::new("/v3/spaces"),
            service_plans: LookupCache::new("/v3/service_plans"),
            service_offerings: LookupCache::new("/v3/service_offerings"),
            service_brokers: LookupCache::new("/v3/service_brokers"),
            users: LookupCache::new("/v3/users"),
        }
    }
}

impl Lookups {
    /// Bulk-load every cache. Organizations and spaces are required; the
    /// others fall back to per-GUID fetches when the bulk listing is refused.
    pub async fn load<A>(&self, client: &A) -> Result<(), ApiError>
    where
        A: ApiClient + ?Sized,
    {
        self.organizations.load_all(client).await?;
        self.spaces.load_all(client).await?;
        for cache in [
            &self.service_plans,
            &self.service_offerings,
            &self.service_brokers,
            &self.users,
        ] {
            if let Err(e) = cache.load_all(client).await {
                warn!(error = %e, "Bulk lookup load failed; resolving on demand");
            }
        }
        Ok(())
    }

    /// `(org name, space name)` of a space.
    pub async fn location<A>(&self, client: &A, space_guid: &str) -> (String, String)
    where
        A: ApiClient + ?Sized,
    {
        let Some(space) = self.spaces.get(client, space_guid).await else {
            return (String::new(), String::new());
        };
        let space_name = str_at(&space, "/name").to_string();
        let org_name = match relationship_guid(&space, "organization") {
            Some(org_guid) => self.organizations.name(client, org_guid).await,
            None => String::new(),
        };
        (org_name, space_name)
    }

    /// `(offering, plan, broker)` names behind a service plan.
    pub async fn plan_chain<A>(&self, client: &A, plan_guid: &str) -> (String, String, String)
    where
        A: ApiClient + ?Sized,
    {
        let Some(plan) = self.service_plans.get(client, plan_guid).await else {
            return Default::default();
        };
        let plan_name = str_at(&plan, "/name").to_string();
        let offering_guid = relationship_guid(&plan, "service_offering").unwrap_or("");
        let Some(offering) = self.service_offerings.get(client, offering_guid).await else {
            return (String::new(), plan_name, String::new());
        };
        let broker = match relationship_guid(&offering, "service_broker") {
            Some(guid) => self.service_brokers.name(client, guid).await,
            None => String::new(),
        };
        (str_at(&offering, "/name").to_string(), plan_name, broker)
    }
}

fn jre_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?:open-jdk-like-jre|sap-machine-jre|zulu-jre|jre)=v?([0-9][0-9A-Za-z._+-]*)").ok()
        })
        .as_ref()
}

/// JRE version announced by the Java buildpack's detect output, if any.
pub fn detect_jre_version(detect_output: &str) -> Option<String> {
    jre_pattern()?
        .captures(detect_output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
}

/// Buildpack facts of a staged droplet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DropletFacts {
    pub detected: Vec<String>,
    pub versions: Vec<String>,
    pub stack: String,
    pub jre_version: Option<String>,
}

pub fn droplet_facts(droplet: &Value) -> DropletFacts {
    let mut facts = DropletFacts {
        stack: str_at(droplet, "/stack").to_string(),
        ..Default::default()
    };
    for bp in droplet
        .get("buildpacks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let name = match str_at(bp, "/buildpack_name") {
            "" => str_at(bp, "/name"),
            n => n,
        };
        if !name.is_empty() {
            facts.detected.push(name.to_string());
        }
        let version = str_at(bp, "/version");
        if !version.is_empty() {
            facts.versions.push(format!("{name}@{version}"));
        }
        if facts.jre_version.is_none() {
            facts.jre_version = detect_jre_version(str_at(bp, "/detect_output"));
        }
    }
    facts
}

/// Totals over all processes of one app; memory and disk come from `web`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessTotals {
    pub instances: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

fn index_processes(processes: &[Value]) -> HashMap<String, ProcessTotals> {
    let mut index: HashMap<String, ProcessTotals> = HashMap::new();
    for process in processes {
        let Some(app_guid) = relationship_guid(process, "app") else { continue };
        let totals = index.entry(app_guid.to_string()).or_default();
        totals.instances += u64_at(process, "/instances");
        if str_at(process, "/type") == "web" || totals.memory_mb == 0 {
            totals.memory_mb = u64_at(process, "/memory_in_mb");
            totals.disk_mb = u64_at(process, "/disk_in_mb");
        }
    }
    index
}

fn index_routes(routes: &[Value]) -> HashMap<String, BTreeSet<String>> {
    let mut index: HashMap<String, BTreeSet<String>> = HashMap::new();
    for route in routes {
        let url = str_at(route, "/url");
        if url.is_empty() {
            continue;
        }
        for dest in route
            .get("destinations")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let app_guid = str_at(dest, "/app/guid");
            if !app_guid.is_empty() {
                index
                    .entry(app_guid.to_string())
                    .or_default()
                    .insert(url.to_string());
            }
        }
    }
    index
}

fn join<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(";")
}

/// Keys of a credentials object (sorted) and its rendering for the CSV.
pub fn render_credentials(details: &Value, redact: bool) -> (String, String) {
    let creds = details.get("credentials").cloned().unwrap_or(Value::Null);
    let keys = creds
        .as_object()
        .map(|m| join(m.keys().collect::<BTreeSet<_>>()))
        .unwrap_or_default();
    let rendered = if creds.is_null() {
        String::new()
    } else if redact {
        REDACTED.to_string()
    } else {
        creds.to_string()
    };
    (keys, rendered)
}

/// Audit event listing for the configured window and type filter.
pub fn audit_events_path(settings: &CollectorSettings) -> String {
    let mut path = list_path("/v3/audit_events") + "&order_by=-created_at";
    if !settings.audit_event_types.is_empty() {
        path.push_str("&types=");
        path.push_str(&settings.audit_event_types.join(","));
    }
    if settings.audit_since_days > 0 {
        let since = ChronoDuration::try_days(settings.audit_since_days)
            .and_then(|window| Utc::now().checked_sub_signed(window));
        match since {
            Some(since) => {
                path.push_str("&created_ats%5Bgt%5D=");
                path.push_str(&since.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
            None => warn!(
                days = settings.audit_since_days,
                "Audit window out of range; collecting events without a start date"
            ),
        }
    }
    path
}

/// Read-only indexes shared by the per-app workers.
struct AppContext<'a> {
    settings: &'a CollectorSettings,
    lookups: &'a Lookups,
    processes: HashMap<String, ProcessTotals>,
    routes: HashMap<String, BTreeSet<String>>,
    bindings_by_app: HashMap<String, Vec<&'a Value>>,
    instance_names: HashMap<String, String>,
    developers_by_space: HashMap<String, BTreeSet<String>>,
}

enum AppSinks {
    Multi {
        apps: CsvSink<AppRecord>,
        bindings: CsvSink<BindingRecord>,
    },
    Single(CsvSink<InventoryRow>),
}

async fn process_app<A>(
    client: &A,
    ctx: &AppContext<'_>,
    sinks: &AppSinks,
    app: &Value,
) -> Result<(), CollectError>
where
    A: ApiClient + ?Sized,
{
    let guid = str_at(app, "/guid");
    let name = str_at(app, "/name");
    let space_guid = relationship_guid(app, "space").unwrap_or("");
    let (org, space) = ctx.lookups.location(client, space_guid).await;

    let droplet = match client
        .get_json(&format!("/v3/apps/{guid}/droplets/current"))
        .await
    {
        Ok(doc) => doc.map(|d| droplet_facts(&d)).unwrap_or_default(),
        Err(e) => {
            debug!(app = name, error = %e, "No current droplet");
            DropletFacts::default()
        }
    };
    let configured = app
        .pointer("/lifecycle/data/buildpacks")
        .and_then(Value::as_array)
        .map(|bps| join(bps.iter().filter_map(Value::as_str)))
        .unwrap_or_default();
    let buildpacks = if configured.is_empty() {
        join(&droplet.detected)
    } else {
        configured
    };
    let stack = match str_at(app, "/lifecycle/data/stack") {
        "" => droplet.stack.clone(),
        s => s.to_string(),
    };
    let totals = ctx.processes.get(guid).copied().unwrap_or_default();
    let routes = join(ctx.routes.get(guid).into_iter().flatten());
    let jre_version = droplet.jre_version.clone().unwrap_or_default();
    let foundation = ctx.settings.foundation.clone();
    let bindings = ctx.bindings_by_app.get(guid).map(Vec::as_slice).unwrap_or(&[]);

    match sinks {
        AppSinks::Single(sink) => {
            let services = join(bindings.iter().map(|b| {
                relationship_guid(b, "service_instance")
                    .and_then(|g| ctx.instance_names.get(g))
                    .map(String::as_str)
                    .unwrap_or("")
            }));
            let developers = join(ctx.developers_by_space.get(space_guid).into_iter().flatten());
            sink.append(&InventoryRow {
                foundation,
                org,
                space,
                app: name.to_string(),
                app_guid: guid.to_string(),
                state: str_at(app, "/state").to_string(),
                buildpacks,
                stack,
                jre_version,
                instances: totals.instances,
                memory_mb: totals.memory_mb,
                routes,
                services,
                developers,
            })
        }
        AppSinks::Multi {
            apps,
            bindings: binding_sink,
        } => {
            for binding in bindings {
                let binding_guid = str_at(binding, "/guid");
                let details = match client
                    .get_json(&format!("/v3/service_credential_bindings/{binding_guid}/details"))
                    .await
                {
                    Ok(doc) => doc.unwrap_or(Value::Null),
                    Err(e) => {
                        warn!(app = name, binding = binding_guid, error = %e, "Binding details unavailable");
                        Value::Null
                    }
                };
                let (credential_keys, credentials) =
                    render_credentials(&details, ctx.settings.redact_credentials);
                binding_sink.append(&BindingRecord {
                    foundation: foundation.clone(),
                    org: org.clone(),
                    space: space.clone(),
                    app: name.to_string(),
                    app_guid: guid.to_string(),
                    service_instance: relationship_guid(binding, "service_instance")
                        .and_then(|g| ctx.instance_names.get(g))
                        .cloned()
                        .unwrap_or_default(),
                    binding_name: str_at(binding, "/name").to_string(),
                    binding_guid: binding_guid.to_string(),
                    credential_keys,
                    credentials,
                })?;
            }
            apps.append(&AppRecord {
                foundation,
                org,
                space,
                app: name.to_string(),
                app_guid: guid.to_string(),
                state: str_at(app, "/state").to_string(),
                lifecycle: str_at(app, "/lifecycle/type").to_string(),
                buildpacks,
                detected_buildpack: join(&droplet.detected),
                buildpack_versions: join(&droplet.versions),
                stack,
                jre_version,
                instances: totals.instances,
                memory_mb: totals.memory_mb,
                disk_mb: totals.disk_mb,
                routes,
                created_at: str_at(app, "/created_at").to_string(),
                updated_at: str_at(app, "/updated_at").to_string(),
            })
        }
    }
}

async fn developer_records<A>(
    client: &A,
    lookups: &Lookups,
    roles: &[Value],
    foundation: &str,
) -> Vec<(Option<String>, DeveloperRecord)>
where
    A: ApiClient + ?Sized,
{
    let mut records = Vec::new();
    for role in roles {
        let role_type = str_at(role, "/type");
        if !ROLE_TYPES.contains(&role_type) {
            continue;
        }
        let user_guid = relationship_guid(role, "user").unwrap_or("");
        let username = match lookups.users.field(client, user_guid, "username").await {
            u if u.is_empty() => lookups.users.field(client, user_guid, "presentation_name").await,
            u => u,
        };
        let space_guid = relationship_guid(role, "space").map(str::to_string);
        let (org, space) = match (&space_guid, relationship_guid(role, "organization")) {
            (Some(space_guid), _) => lookups.location(client, space_guid).await,
            (None, Some(org_guid)) => (lookups.organizations.name(client, org_guid).await, String::new()),
            (None, None) => Default::default(),
        };
        records.push((
            space_guid,
            DeveloperRecord {
                foundation: foundation.to_string(),
                org,
                space,
                username,
                user_guid: user_guid.to_string(),
                role: role_type.to_string(),
            },
        ));
    }
    records
}

async fn write_services<A>(
    client: &A,
    lookups: &Lookups,
    instances: &[Value],
    bound: &HashMap<&str, usize>,
    settings: &CollectorSettings,
) -> Result<usize, CollectError>
where
    A: ApiClient + ?Sized,
{
    let sink = CsvSink::<ServiceRecord>::create(settings.output_dir.join("services.csv"))?;
    for instance in instances {
        let guid = str_at(instance, "/guid");
        let (org, space) = lookups
            .location(client, relationship_guid(instance, "space").unwrap_or(""))
            .await;
        let kind = str_at(instance, "/type").to_string();
        let (offering, plan, broker) = match relationship_guid(instance, "service_plan") {
            Some(plan_guid) => lookups.plan_chain(client, plan_guid).await,
            None => Default::default(),
        };
        sink.append(&ServiceRecord {
            foundation: settings.foundation.clone(),
            org,
            space,
            service_instance: str_at(instance, "/name").to_string(),
            service_instance_guid: guid.to_string(),
            kind,
            offering,
            plan,
            broker,
            bound_apps: bound.get(guid).copied().unwrap_or(0),
            created_at: str_at(instance, "/created_at").to_string(),
        })?;
    }
    sink.finish()
}

async fn write_audit_events<A>(
    client: &A,
    lookups: &Lookups,
    settings: &CollectorSettings,
) -> Result<usize, CollectError>
where
    A: ApiClient + ?Sized,
{
    let sink = CsvSink::<AuditEventRecord>::create(settings.output_dir.join("audit_events.csv"))?;
    let events = match paginate(client, &audit_events_path(settings)).await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "Audit events unavailable; writing an empty table");
            Vec::new()
        }
    };
    for event in &events {
        let (org, space) = match (str_at(event, "/space/guid"), str_at(event, "/organization/guid")) {
            ("", "") => Default::default(),
            ("", org_guid) => (lookups.organizations.name(client, org_guid).await, String::new()),
            (space_guid, _) => lookups.location(client, space_guid).await,
        };
        sink.append(&AuditEventRecord {
            foundation: settings.foundation.clone(),
            created_at: str_at(event, "/created_at").to_string(),
            event_type: str_at(event, "/type").to_string(),
            actor_type: str_at(event, "/actor/type").to_string(),
            actor: str_at(event, "/actor/name").to_string(),
            target_type: str_at(event, "/target/type").to_string(),
            target: str_at(event, "/target/name").to_string(),
            org,
            space,
        })?;
    }
    sink.finish()
}

async fn write_buildpacks<A>(client: &A, settings: &CollectorSettings) -> Result<usize, CollectError>
where
    A: ApiClient + ?Sized,
{
    let sink = CsvSink::<BuildpackRecord>::create(settings.output_dir.join("buildpacks.csv"))?;
    for bp in paginate(client, &list_path("/v3/buildpacks")).await? {
        sink.append(&BuildpackRecord {
            foundation: settings.foundation.clone(),
            name: str_at(&bp, "/name").to_string(),
            stack: str_at(&bp, "/stack").to_string(),
            position: bp.get("position").and_then(Value::as_i64).unwrap_or(0),
            enabled: bp.get("enabled").and_then(Value::as_bool).unwrap_or(false),
            locked: bp.get("locked").and_then(Value::as_bool).unwrap_or(false),
            filename: str_at(&bp, "/filename").to_string(),
            state: str_at(&bp, "/state").to_string(),
            updated_at: str_at(&bp, "/updated_at").to_string(),
        })?;
    }
    sink.finish()
}

async fn write_stacks<A>(
    client: &A,
    settings: &CollectorSettings,
    apps: &[Value],
) -> Result<usize, CollectError>
where
    A: ApiClient + ?Sized,
{
    let mut usage: HashMap<&str, usize> = HashMap::new();
    for app in apps {
        let stack = str_at(app, "/lifecycle/data/stack");
        if !stack.is_empty() {
            *usage.entry(stack).or_default() += 1;
        }
    }
    let sink = CsvSink::<StackRecord>::create(settings.output_dir.join("stacks.csv"))?;
    for stack in paginate(client, &list_path("/v3/stacks")).await? {
        let name = str_at(&stack, "/name");
        sink.append(&StackRecord {
            foundation: settings.foundation.clone(),
            name: name.to_string(),
            description: str_at(&stack, "/description").to_string(),
            default: stack.get("default").and_then(Value::as_bool).unwrap_or(false),
            apps: usage.get(name).copied().unwrap_or(0),
        })?;
    }
    sink.finish()
}

/// Collect the whole foundation into `settings.output_dir`.
pub async fn collect_inventory<A>(
    client: &A,
    settings: &CollectorSettings,
) -> Result<InventoryReport, CollectError>
where
    A: ApiClient + ?Sized,
{
    let span = info_span!("collect", foundation = %settings.foundation, mode = ?settings.mode);
    async move {
        settings.trace_loaded();
        let lookups = Lookups::default();
        lookups.load(client).await?;

        let apps = paginate(client, &list_path("/v3/apps")).await?;
        let processes = paginate(client, &list_path("/v3/processes")).await?;
        let routes = paginate(client, &list_path("/v3/routes")).await?;
        let instances = paginate(client, &list_path("/v3/service_instances")).await?;
        let bindings =
            paginate(client, &list_path("/v3/service_credential_bindings?type=app")).await?;
        let roles = paginate(client, &list_path("/v3/roles")).await?;
        info!(
            apps = apps.len(),
            service_instances = instances.len(),
            bindings = bindings.len(),
            roles = roles.len(),
            "Foundation listings loaded"
        );

        let mut bindings_by_app: HashMap<String, Vec<&Value>> = HashMap::new();
        let mut bound: HashMap<&str, usize> = HashMap::new();
        for binding in &bindings {
            if let Some(app_guid) = relationship_guid(binding, "app") {
                bindings_by_app
                    .entry(app_guid.to_string())
                    .or_default()
                    .push(binding);
            }
            if let Some(si) = relationship_guid(binding, "service_instance") {
                *bound.entry(si).or_default() += 1;
            }
        }

        let developers = developer_records(client, &lookups, &roles, &settings.foundation).await;
        let mut developers_by_space: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (space_guid, record) in &developers {
            if let (Some(space_guid), "space_developer") = (space_guid, record.role.as_str()) {
                developers_by_space
                    .entry(space_guid.clone())
                    .or_default()
                    .insert(record.username.clone());
            }
        }

        let ctx = AppContext {
            settings,
            lookups: &lookups,
            processes: index_processes(&processes),
            routes: index_routes(&routes),
            bindings_by_app,
            instance_names: instances
                .iter()
                .map(|si| (str_at(si, "/guid").to_string(), str_at(si, "/name").to_string()))
                .collect(),
            developers_by_space,
        };

        let sinks = match settings.mode {
            OutputMode::Single => {
                AppSinks::Single(CsvSink::create(settings.output_dir.join("inventory.csv"))?)
            }
            OutputMode::Multi => AppSinks::Multi {
                apps: CsvSink::create(settings.output_dir.join("apps.csv"))?,
                bindings: CsvSink::create(settings.output_dir.join("bindings.csv"))?,
            },
        };

        let workers = settings.workers.max(1);
        let ctx = &ctx;
        let sinks_ref = &sinks;
        let results: Vec<Result<(), CollectError>> = stream::iter(apps.iter())
            .map(|app| async move { process_app(client, ctx, sinks_ref, app).await })
            .buffer_unordered(workers)
            .collect()
            .await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;

        let mut files = BTreeMap::new();
        match sinks {
            AppSinks::Single(sink) => {
                files.insert("inventory.csv".to_string(), sink.finish()?);
            }
            AppSinks::Multi { apps: app_sink, bindings: binding_sink } => {
                files.insert("apps.csv".to_string(), app_sink.finish()?);
                files.insert("bindings.csv".to_string(), binding_sink.finish()?);
                files.insert(
                    "services.csv".to_string(),
                    write_services(client, &lookups, &instances, &bound, settings).await?,
                );
                let dev_sink =
                    CsvSink::<DeveloperRecord>::create(settings.output_dir.join("developers.csv"))?;
                for (_, record) in &developers {
                    dev_sink.append(record)?;
                }
                files.insert("developers.csv".to_string(), dev_sink.finish()?);
                if settings.audit_events {
                    files.insert(
                        "audit_events.csv".to_string(),
                        write_audit_events(client, &lookups, settings).await?,
                    );
                }
                files.insert("buildpacks.csv".to_string(), write_buildpacks(client, settings).await?);
                files.insert(
                    "stacks.csv".to_string(),
                    write_stacks(client, settings, &apps).await?,
                );
            }
        }

        let report = InventoryReport {
            foundation: settings.foundation.clone(),
            mode: settings.mode,
            apps: apps.len(),
            files,
        };
        info!(apps = report.apps, files = ?report.files, "Inventory collected");
        Ok(report)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jre_version_comes_from_detect_output() {
        let out = "java-buildpack=v4.63.1-offline-https://github.com/cloudfoundry/java-buildpack#d6a3b6b \
                   open-jdk-like-jre=17.0.10_11 open-jdk-like-memory-calculator=3.13.0_RELEASE";
        assert_eq!(detect_jre_version(out).as_deref(), Some("17.0.10_11"));
        assert_eq!(detect_jre_version("nodejs"), None);
    }

    #[test]
    fn droplet_facts_prefer_buildpack_name() {
        let droplet = json!({
            "stack": "cflinuxfs4",
            "buildpacks": [
                {"name": "java_buildpack_offline", "buildpack_name": "java", "version": "4.63.1",
                 "detect_output": "open-jdk-like-jre=11.0.22_7"},
                {"name": "https://github.com/x/apm-buildpack", "detect_output": "apm"}
            ]
        });
        let facts = droplet_facts(&droplet);
        assert_eq!(facts.detected, vec!["java", "https://github.com/x/apm-buildpack"]);
        assert_eq!(facts.versions, vec!["java@4.63.1"]);
        assert_eq!(facts.jre_version.as_deref(), Some("11.0.22_7"));
        assert_eq!(facts.stack, "cflinuxfs4");
    }

    #[test]
    fn credentials_are_redacted_but_keys_listed() {
        let details = json!({"credentials": {"uri": "postgres://u:p@h/db", "password": "p"}});
        assert_eq!(
            render_credentials(&details, true),
            ("password;uri".to_string(), REDACTED.to_string())
        );
        let (_, plain) = render_credentials(&details, false);
        assert!(plain.contains("postgres://"));
        assert_eq!(render_credentials(&Value::Null, true), (String::new(), String::new()));
    }

    #[test]
    fn processes_sum_instances_and_take_web_memory() {
        let procs = vec![
            json!({"type": "worker", "instances": 1, "memory_in_mb": 256, "disk_in_mb": 512,
                   "relationships": {"app": {"data": {"guid": "a"}}}}),
            json!({"type": "web", "instances": 3, "memory_in_mb": 1024, "disk_in_mb": 1024,
                   "relationships": {"app": {"data": {"guid": "a"}}}}),
        ];
        let idx = index_processes(&procs);
        assert_eq!(
            idx["a"],
            ProcessTotals { instances: 4, memory_mb: 1024, disk_mb: 1024 }
        );
    }

    #[test]
    fn audit_path_carries_filters() {
        let settings = CollectorSettings {
            audit_event_types: vec!["audit.app.create".into(), "audit.app.update".into()],
            audit_since_days: 0,
            ..Default::default()
        };
        assert_eq!(
            audit_events_path(&settings),
            "/v3/audit_events?per_page=5000&order_by=-created_at&types=audit.app.create,audit.app.update"
        );
    }

    #[test]
    fn out_of_range_audit_window_drops_the_date_filter() {
        let settings = CollectorSettings {
            audit_since_days: i64::MAX,
            ..Default::default()
        };
        let path = audit_events_path(&settings);
        assert!(!path.contains("created_ats"), "{path}");

        let settings = CollectorSettings {
            audit_since_days: 7,
            ..Default::default()
        };
        assert!(audit_events_path(&settings).contains("&created_ats%5Bgt%5D="));
    }
}
