//! Name → identifier lookups.
//!
//! Every lookup lists the candidates once and matches the caller's selector
//! against each candidate's name, display text or id. Nothing here mutates
//! provider state.

use crate::api::{ApiParams, CloudStackApi, Command, ParamsBuilder};
use crate::error::{CloudStackError, CloudStackResult};

use serde_json::Value;
use std::fmt;

/// Kinds of resource the resolver knows how to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Project,
    Zone,
    Template,
    Iso,
    ServiceOffering,
    DiskOffering,
    Hypervisor,
    NetworkList,
    SecurityGroups,
    AffinityGroups,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Zone => "zone",
            Self::Template => "template",
            Self::Iso => "ISO",
            Self::ServiceOffering => "service offering",
            Self::DiskOffering => "disk offering",
            Self::Hypervisor => "hypervisor",
            Self::NetworkList => "network",
            Self::SecurityGroups => "security group",
            Self::AffinityGroups => "affinity group",
        }
    }

    /// Listing command and the array key of its response.
    fn listing(&self) -> Option<(Command, &'static str)> {
        match self {
            Self::Project => Some((Command::ListProjects, "project")),
            Self::Zone => Some((Command::ListZones, "zone")),
            Self::Template => Some((Command::ListTemplates, "template")),
            Self::Iso => Some((Command::ListIsos, "iso")),
            Self::ServiceOffering => Some((Command::ListServiceOfferings, "serviceoffering")),
            Self::DiskOffering => Some((Command::ListDiskOfferings, "diskoffering")),
            Self::Hypervisor => Some((Command::ListHypervisors, "hypervisor")),
            Self::NetworkList => Some((Command::ListNetworks, "network")),
            Self::SecurityGroups | Self::AffinityGroups => None,
        }
    }

    /// Fields a selector is compared against.
    fn match_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Hypervisor => &["name"],
            Self::NetworkList => &["name", "id"],
            _ => &["name", "displaytext", "id"],
        }
    }

    /// Whether an empty selector picks the first listed candidate.
    fn defaults_to_first(&self) -> bool {
        matches!(self, Self::Zone | Self::Hypervisor | Self::ServiceOffering)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Image a VM is deployed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSelector<'s> {
    Template(&'s str),
    Iso(&'s str),
}

impl<'s> ImageSelector<'s> {
    /// Enforce that exactly one of `template` / `iso` is set.
    ///
    /// Empty strings count as unset. Purely local: no remote call is made.
    pub fn choose(template: Option<&'s str>, iso: Option<&'s str>) -> CloudStackResult<Self> {
        let template = template.filter(|s| !s.is_empty());
        let iso = iso.filter(|s| !s.is_empty());
        match (template, iso) {
            (Some(t), None) => Ok(Self::Template(t)),
            (None, Some(i)) => Ok(Self::Iso(i)),
            (Some(_), Some(_)) => Err(CloudStackError::invalid_spec(
                "Template and ISO are mutually exclusive",
            )),
            (None, None) => Err(CloudStackError::invalid_spec(
                "Template or ISO is required",
            )),
        }
    }
}

/// Lookups scoped to an optional project and zone.
pub struct ResourceResolver<'a> {
    api: &'a dyn CloudStackApi,
    project_id: Option<String>,
    zone_id: Option<String>,
}

impl<'a> ResourceResolver<'a> {
    pub fn new(api: &'a dyn CloudStackApi) -> Self {
        Self {
            api,
            project_id: None,
            zone_id: None,
        }
    }

    /// Scope template, ISO and network listings.
    pub fn scoped(mut self, project_id: Option<String>, zone_id: Option<String>) -> Self {
        self.project_id = project_id;
        self.zone_id = zone_id;
        self
    }

    // ── Generic ─────────────────────────────────────────────────────

    /// Resolve `selector` of `kind` to the value the provider expects.
    ///
    /// For zone, hypervisor and service offering an empty selector picks the
    /// first candidate. Network lists and group lists take a comma-separated
    /// selector and return a comma-separated value.
    pub async fn resolve(&self, kind: ResourceKind, selector: &str) -> CloudStackResult<String> {
        match kind {
            ResourceKind::NetworkList => {
                let names = split_list(selector);
                Ok(self.network_ids(&names).await?.unwrap_or_default())
            }
            ResourceKind::SecurityGroups | ResourceKind::AffinityGroups => {
                Ok(group_names(&split_list(selector)))
            }
            _ => self.lookup(kind, selector).await,
        }
    }

    async fn lookup(&self, kind: ResourceKind, selector: &str) -> CloudStackResult<String> {
        let items = self.list(kind).await?;

        if selector.is_empty() && kind.defaults_to_first() {
            return items
                .first()
                .and_then(|item| identifier(kind, item))
                .ok_or_else(|| CloudStackError::not_found(kind.label(), "<default>"));
        }

        items
            .iter()
            .find(|item| matches(kind, item, selector))
            .and_then(|item| identifier(kind, item))
            .ok_or_else(|| CloudStackError::not_found(kind.label(), selector))
    }

    async fn list(&self, kind: ResourceKind) -> CloudStackResult<Vec<Value>> {
        let Some((command, key)) = kind.listing() else {
            return Ok(Vec::new());
        };
        let resp = self.api.execute(command, self.listing_params(kind)).await?;
        Ok(resp
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn listing_params(&self, kind: ResourceKind) -> ApiParams {
        match kind {
            ResourceKind::Project => ParamsBuilder::new().set("listall", "true").build(),
            ResourceKind::Template => ParamsBuilder::new()
                .set("templatefilter", "executable")
                .opt("zoneid", self.zone_id.clone())
                .opt("projectid", self.project_id.clone())
                .build(),
            ResourceKind::Iso => ParamsBuilder::new()
                .set("isofilter", "executable")
                .opt("zoneid", self.zone_id.clone())
                .opt("projectid", self.project_id.clone())
                .build(),
            ResourceKind::NetworkList => ParamsBuilder::new()
                .opt("zoneid", self.zone_id.clone())
                .opt("projectid", self.project_id.clone())
                .build(),
            _ => ApiParams::new(),
        }
    }

    // ── Typed helpers ───────────────────────────────────────────────

    /// `None` when no project is requested.
    pub async fn project_id(&self, selector: Option<&str>) -> CloudStackResult<Option<String>> {
        match non_empty(selector) {
            Some(s) => self.lookup(ResourceKind::Project, s).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn zone_id(&self, selector: Option<&str>) -> CloudStackResult<String> {
        self.lookup(ResourceKind::Zone, non_empty(selector).unwrap_or(""))
            .await
    }

    /// Id of the template or ISO to deploy from.
    pub async fn image_id(&self, image: ImageSelector<'_>) -> CloudStackResult<String> {
        match image {
            ImageSelector::Template(t) => self.lookup(ResourceKind::Template, t).await,
            ImageSelector::Iso(i) => self.lookup(ResourceKind::Iso, i).await,
        }
    }

    pub async fn service_offering_id(&self, selector: Option<&str>) -> CloudStackResult<String> {
        self.lookup(ResourceKind::ServiceOffering, non_empty(selector).unwrap_or(""))
            .await
    }

    /// `None` when no disk offering is requested.
    pub async fn disk_offering_id(
        &self,
        selector: Option<&str>,
    ) -> CloudStackResult<Option<String>> {
        match non_empty(selector) {
            Some(s) => self.lookup(ResourceKind::DiskOffering, s).await.map(Some),
            None => Ok(None),
        }
    }

    /// Hypervisor name as spelled by the provider.
    pub async fn hypervisor(&self, selector: Option<&str>) -> CloudStackResult<String> {
        self.lookup(ResourceKind::Hypervisor, non_empty(selector).unwrap_or(""))
            .await
    }

    /// Comma-joined network ids in request order; `None` for an empty list.
    pub async fn network_ids(&self, selectors: &[String]) -> CloudStackResult<Option<String>> {
        if selectors.is_empty() {
            return Ok(None);
        }
        let networks = self.list(ResourceKind::NetworkList).await?;

        let mut ids = Vec::with_capacity(selectors.len());
        for selector in selectors {
            let id = networks
                .iter()
                .find(|n| matches(ResourceKind::NetworkList, n, selector))
                .and_then(|n| identifier(ResourceKind::NetworkList, n))
                .ok_or_else(|| CloudStackError::not_found("network", selector))?;
            ids.push(id);
        }
        Ok(Some(ids.join(",")))
    }
}

/// Join security/affinity group names; an empty list yields `""`.
pub fn group_names(names: &[String]) -> String {
    names.join(",")
}

fn non_empty(selector: Option<&str>) -> Option<&str> {
    selector.filter(|s| !s.is_empty())
}

fn split_list(selector: &str) -> Vec<String> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn matches(kind: ResourceKind, item: &Value, selector: &str) -> bool {
    kind.match_fields().iter().any(|field| {
        let Some(value) = item.get(*field).and_then(Value::as_str) else {
            return false;
        };
        if kind == ResourceKind::Hypervisor {
            value.eq_ignore_ascii_case(selector)
        } else {
            value == selector
        }
    })
}

/// Hypervisors have no id; their name is the identifier.
fn identifier(kind: ResourceKind, item: &Value) -> Option<String> {
    let field = if kind == ResourceKind::Hypervisor { "name" } else { "id" };
    item.get(field).and_then(Value::as_str).map(String::from)
}
