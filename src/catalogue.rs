//! THREDDS catalogue loading: fetch `catalog.xml`, walk the dataset tree,
//! resolve HTTP file-server access URLs and apply the definition's filter.

use std::collections::BTreeMap;
use std::fs;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::definition::{CatalogueSource, DownloadDefinition};
use crate::error::MirrorError;
use crate::fetch;

#[derive(Debug, Clone)]
pub struct Catalogue {
    pub base_url: String,
    pub services: Vec<Service>,
    pub datasets: Vec<CatalogueDataset>,
}

#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub service_type: String,
    pub base: String,
    pub nested: Vec<Service>,
}

impl Service {
    fn is_file_server(&self) -> bool {
        self.service_type.eq_ignore_ascii_case("httpserver")
    }

    fn find_file_server(&self) -> Option<&Service> {
        if self.is_file_server() {
            return Some(self);
        }
        self.nested.iter().find_map(Service::find_file_server)
    }
}

#[derive(Debug, Clone)]
pub struct CatalogueDataset {
    pub id: Option<String>,
    pub name: String,
    pub url_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub last_modified: Option<i64>,
    pub service_name: Option<String>,
    pub access: Vec<Access>,
    pub nested: Vec<CatalogueDataset>,
}

#[derive(Debug, Clone)]
pub struct Access {
    pub service_name: String,
    pub url_path: String,
}

/// One dataset flattened out of the tree, with service names inherited from
/// enclosing datasets.
#[derive(Debug, Clone)]
pub struct FlatDataset {
    pub id: Option<String>,
    pub url_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub last_modified: Option<i64>,
    pub service_name: Option<String>,
    pub access: Vec<Access>,
}

impl Catalogue {
    /// All datasets in the tree, nested ones included.
    pub fn all_datasets(&self) -> Vec<FlatDataset> {
        let mut flattened = Vec::new();
        for dataset in &self.datasets {
            flatten_dataset(dataset, None, &mut flattened);
        }
        flattened
    }

    fn find_service(&self, name: &str) -> Option<&Service> {
        fn find<'a>(services: &'a [Service], name: &str) -> Option<&'a Service> {
            for service in services {
                if service.name == name {
                    return Some(service);
                }
                if let Some(found) = find(&service.nested, name) {
                    return Some(found);
                }
            }
            None
        }
        find(&self.services, name)
    }

    fn any_file_server(&self) -> Option<&Service> {
        self.services.iter().find_map(Service::find_file_server)
    }

    /// HTTP file-server URL for a dataset, or None when the catalogue offers
    /// no such access for it.
    pub fn file_server_uri(&self, dataset: &FlatDataset) -> Option<String> {
        for access in &dataset.access {
            if let Some(service) = self.find_service(&access.service_name) {
                if let Some(file_server) = service.find_file_server() {
                    return Some(self.service_uri(file_server, &access.url_path));
                }
            }
        }

        let url_path = dataset.url_path.as_deref()?;
        if let Some(name) = &dataset.service_name {
            if let Some(service) = self.find_service(name) {
                if let Some(file_server) = service.find_file_server() {
                    return Some(self.service_uri(file_server, url_path));
                }
            }
        }
        self.any_file_server()
            .map(|service| self.service_uri(service, url_path))
    }

    fn service_uri(&self, service: &Service, url_path: &str) -> String {
        if service.base.is_empty() {
            resolve_url(&self.base_url, url_path)
        } else {
            let base = resolve_url(&self.base_url, &service.base);
            format!("{base}{url_path}")
        }
    }
}

fn flatten_dataset(
    dataset: &CatalogueDataset,
    inherited_service: Option<&str>,
    out: &mut Vec<FlatDataset>,
) {
    let service_name = dataset
        .service_name
        .as_deref()
        .or(inherited_service)
        .map(str::to_string);
    out.push(FlatDataset {
        id: dataset.id.clone(),
        url_path: dataset.url_path.clone(),
        size_bytes: dataset.size_bytes,
        last_modified: dataset.last_modified,
        service_name: service_name.clone(),
        access: dataset.access.clone(),
    });
    for nested in &dataset.nested {
        flatten_dataset(nested, service_name.as_deref(), out);
    }
}

/// Resolve a service base or url path against the catalogue URL.
fn resolve_url(base: &str, reference: &str) -> String {
    if reference.contains("://") {
        return reference.to_string();
    }
    let scheme_end = base.find("://").map(|idx| idx + 3);
    if reference.starts_with('/') {
        if let Some(scheme_end) = scheme_end {
            let authority_end = base[scheme_end..]
                .find('/')
                .map(|idx| scheme_end + idx)
                .unwrap_or(base.len());
            return format!("{}{}", &base[..authority_end], reference);
        }
        return reference.to_string();
    }
    match base.rfind('/') {
        Some(idx) if idx + 1 > scheme_end.unwrap_or(0) => {
            format!("{}/{}", &base[..idx], reference)
        }
        _ => format!("{base}/{reference}"),
    }
}

pub fn filename_of(url_path: &str) -> &str {
    url_path.rsplit('/').next().unwrap_or(url_path)
}

// ---------------------------------------------------------------------------
// XML parsing

fn xml_error(base_url: &str, err: impl std::fmt::Display) -> MirrorError {
    MirrorError::CatalogueParse {
        url: base_url.to_string(),
        message: err.to_string(),
    }
}

pub fn parse_catalogue(xml: &str, base_url: &str) -> Result<Catalogue, MirrorError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut catalogue = Catalogue {
        base_url: base_url.to_string(),
        services: Vec::new(),
        datasets: Vec::new(),
    };
    let mut buf = Vec::new();
    let parse_err = |err| xml_error(base_url, err);

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"service" => catalogue
                    .services
                    .push(parse_service(&mut reader, &e, base_url)?),
                b"dataset" => catalogue
                    .datasets
                    .push(parse_dataset(&mut reader, &e, base_url)?),
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"service" {
                    catalogue.services.push(service_from_attrs(&e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(catalogue)
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

fn service_from_attrs(e: &BytesStart<'_>) -> Service {
    Service {
        name: attr(e, b"name").unwrap_or_default(),
        service_type: attr(e, b"serviceType").unwrap_or_default(),
        base: attr(e, b"base").unwrap_or_default(),
        nested: Vec::new(),
    }
}

fn parse_service(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    base_url: &str,
) -> Result<Service, MirrorError> {
    let mut service = service_from_attrs(start);
    let mut buf = Vec::new();
    let parse_err = |err| xml_error(base_url, err);

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_err)? {
            Event::Start(e) if e.local_name().as_ref() == b"service" => {
                service.nested.push(parse_service(reader, &e, base_url)?);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"service" => {
                service.nested.push(service_from_attrs(&e));
            }
            Event::End(e) if e.local_name().as_ref() == b"service" => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(service)
}

fn dataset_from_attrs(e: &BytesStart<'_>) -> CatalogueDataset {
    CatalogueDataset {
        id: attr(e, b"ID"),
        name: attr(e, b"name").unwrap_or_default(),
        url_path: attr(e, b"urlPath").filter(|path| !path.is_empty()),
        size_bytes: None,
        last_modified: None,
        service_name: attr(e, b"serviceName"),
        access: Vec::new(),
        nested: Vec::new(),
    }
}

fn parse_dataset(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    base_url: &str,
) -> Result<CatalogueDataset, MirrorError> {
    let mut dataset = dataset_from_attrs(start);
    let mut buf = Vec::new();
    let parse_err = |err| xml_error(base_url, err);

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"dataset" => dataset.nested.push(parse_dataset(reader, &e, base_url)?),
                b"dataSize" => {
                    let units = attr(&e, b"units");
                    let text = read_element_text(reader, b"dataSize", base_url)?;
                    dataset.size_bytes = parse_data_size(&text, units.as_deref());
                }
                b"date" => {
                    let date_type = attr(&e, b"type");
                    let text = read_element_text(reader, b"date", base_url)?;
                    if date_type.as_deref() == Some("modified") {
                        dataset.last_modified = parse_timestamp_millis(&text);
                    }
                }
                b"serviceName" => {
                    let text = read_element_text(reader, b"serviceName", base_url)?;
                    if !text.is_empty() {
                        dataset.service_name = Some(text);
                    }
                }
                b"metadata" => parse_metadata(reader, &mut dataset, base_url)?,
                b"access" => {
                    if let Some(access) = access_from_attrs(&e) {
                        dataset.access.push(access);
                    }
                    skip_element(reader, b"access", base_url)?;
                }
                _ => skip_element(reader, e.local_name().as_ref(), base_url)?,
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"dataset" => dataset.nested.push(dataset_from_attrs(&e)),
                b"access" => {
                    if let Some(access) = access_from_attrs(&e) {
                        dataset.access.push(access);
                    }
                }
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"dataset" => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(dataset)
}

fn access_from_attrs(e: &BytesStart<'_>) -> Option<Access> {
    Some(Access {
        service_name: attr(e, b"serviceName")?,
        url_path: attr(e, b"urlPath")?,
    })
}

fn parse_metadata(
    reader: &mut Reader<&[u8]>,
    dataset: &mut CatalogueDataset,
    base_url: &str,
) -> Result<(), MirrorError> {
    let mut buf = Vec::new();
    let parse_err = |err| xml_error(base_url, err);

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"serviceName" => {
                    let text = read_element_text(reader, b"serviceName", base_url)?;
                    if !text.is_empty() {
                        dataset.service_name = Some(text);
                    }
                }
                other => {
                    let owned = other.to_vec();
                    skip_element(reader, &owned, base_url)?;
                }
            },
            Event::End(e) if e.local_name().as_ref() == b"metadata" => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn read_element_text(
    reader: &mut Reader<&[u8]>,
    end_tag: &[u8],
    base_url: &str,
) -> Result<String, MirrorError> {
    let mut buf = Vec::new();
    let mut text = String::new();
    let parse_err = |err| xml_error(base_url, err);

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_err)? {
            Event::Text(e) => {
                text.push_str(&e.unescape().map_err(|err| xml_error(base_url, err))?)
            }
            Event::End(e) if e.local_name().as_ref() == end_tag => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(text.trim().to_string())
}

fn skip_element(
    reader: &mut Reader<&[u8]>,
    end_tag: &[u8],
    base_url: &str,
) -> Result<(), MirrorError> {
    let mut buf = Vec::new();
    let mut depth = 1;
    let parse_err = |err| xml_error(base_url, err);

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_err)? {
            Event::Start(_) => depth += 1,
            Event::End(e) => {
                depth -= 1;
                if depth == 0 && e.local_name().as_ref() == end_tag {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_data_size(text: &str, units: Option<&str>) -> Option<u64> {
    let value: f64 = text.trim().parse().ok()?;
    let multiplier = match units.unwrap_or("bytes") {
        u if u.eq_ignore_ascii_case("bytes") => 1.0,
        u if u.eq_ignore_ascii_case("kbytes") => 1024.0,
        u if u.eq_ignore_ascii_case("mbytes") => 1024.0 * 1024.0,
        u if u.eq_ignore_ascii_case("gbytes") => 1024.0 * 1024.0 * 1024.0,
        u if u.eq_ignore_ascii_case("tbytes") => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    Some((value * multiplier).round() as u64)
}

/// Advertised modified date to epoch milliseconds; unknown dates become None
/// and are treated as 0 downstream.
fn parse_timestamp_millis(text: &str) -> Option<i64> {
    if let Ok(date) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(date.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

// ---------------------------------------------------------------------------
// Loader

/// A parsed catalogue together with the source it came from.
#[derive(Debug, Clone)]
pub struct CatalogueEntry {
    pub catalogue: Catalogue,
    pub source: CatalogueSource,
}

/// A catalogue dataset admitted for reconciliation.
#[derive(Debug, Clone)]
pub struct DatasetEntry {
    pub dataset_id: String,
    pub filename: String,
    pub source_uri: String,
    pub size_bytes: u64,
    pub last_modified: i64,
    pub sub_directory: Option<String>,
}

/// Per-definition catalogue loader. Parsed catalogues are memoised on the
/// instance; construct one loader per definition per run.
pub struct CatalogueLoader {
    definition: DownloadDefinition,
    catalogues: Option<Vec<CatalogueEntry>>,
}

impl CatalogueLoader {
    pub fn new(definition: &DownloadDefinition) -> Self {
        Self {
            definition: definition.clone(),
            catalogues: None,
        }
    }

    fn catalogues(&mut self) -> Result<&[CatalogueEntry], MirrorError> {
        if self.catalogues.is_none() {
            let mut entries = Vec::new();
            for source in &self.definition.catalogue_urls {
                match fetch_catalogue(&source.catalogue_url) {
                    Ok(catalogue) => entries.push(CatalogueEntry {
                        catalogue,
                        source: source.clone(),
                    }),
                    Err(err) => {
                        warn!(
                            url = %source.catalogue_url,
                            error = %err,
                            "skipping catalogue source"
                        );
                    }
                }
            }
            self.catalogues = Some(entries);
        }
        Ok(self.catalogues.as_deref().unwrap_or_default())
    }

    /// The `dataset id → entry` map across all catalogue sources, filtered
    /// by the definition's selection rule. Later sources overwrite on id
    /// collision.
    pub fn datasets(&mut self) -> Result<BTreeMap<String, DatasetEntry>, MirrorError> {
        let definition = self.definition.clone();
        let mut datasets = BTreeMap::new();
        for entry in self.catalogues()? {
            let filter = definition.source_filter(&entry.source)?;
            for flat in entry.catalogue.all_datasets() {
                let Some(url_path) = flat.url_path.clone() else {
                    continue;
                };
                let Some(source_uri) = entry.catalogue.file_server_uri(&flat) else {
                    continue;
                };
                let filename = filename_of(&url_path).to_string();
                if !filter.admits(&filename) {
                    continue;
                }
                let dataset_id = flat.id.clone().unwrap_or_else(|| url_path.clone());
                datasets.insert(
                    dataset_id.clone(),
                    DatasetEntry {
                        dataset_id,
                        filename,
                        source_uri,
                        size_bytes: flat.size_bytes.unwrap_or(0),
                        last_modified: flat.last_modified.unwrap_or(0),
                        sub_directory: entry.source.sub_directory.clone(),
                    },
                );
            }
        }
        Ok(datasets)
    }
}

fn fetch_catalogue(url: &str) -> Result<Catalogue, MirrorError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let client = fetch::open_http_client()?;
        let response = client
            .get(url)
            .send()
            .map_err(|err| MirrorError::CatalogueHttp(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::TransportStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response
            .text()
            .map_err(|err| MirrorError::CatalogueHttp(err.to_string()))?;
        parse_catalogue(&body, url)
    } else {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let body =
            fs::read_to_string(path).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        parse_catalogue(&body, url)
    }
}
