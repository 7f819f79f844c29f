//! Name resolver
//!
//! Maps result ids to indicator names by joining lookup tables fetched in
//! bulk. Two join paths exist, one per schema generation:
//!
//! - components: result → componente_resultado → componentes_indicador → indicator
//! - raw data:   result → resultado_datos_brutos → datos_brutos → indicator
//!
//! The schema version picks the path; `auto` tries components first and
//! falls back to raw data when the first path maps nothing.

use anyhow::{Context, Result};
use common::config::SchemaVersion;
use common::model::{ComponentLink, IndicatorComponent, IndicatorDefinition, RawDataLink, RawDatum, Table};
use common::store::{fetch_all, Select, Store};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Components,
    RawData,
}

impl Strategy {
    /// Strategies to try, in order, for a schema version.
    pub fn plan(schema: SchemaVersion) -> &'static [Strategy] {
        match schema {
            SchemaVersion::V1 => &[Strategy::RawData],
            SchemaVersion::V2 => &[Strategy::Components],
            SchemaVersion::Auto => &[Strategy::Components, Strategy::RawData],
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Components => write!(f, "components"),
            Strategy::RawData => write!(f, "raw-data"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Strategy that produced the mapping; `None` when nothing mapped.
    pub strategy: Option<Strategy>,
    /// result id → indicator name
    pub names: BTreeMap<i64, String>,
    pub attempted: Vec<Strategy>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct NamedRow {
    id: i64,
    nombre: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IndicatorRef {
    id: i64,
    id_indicador: Option<i64>,
}

pub struct NameResolver<'a> {
    store: &'a dyn Store,
    page_size: usize,
    max_rows: usize,
    definitions: Option<HashMap<i64, String>>,
}

impl<'a> NameResolver<'a> {
    pub fn new(store: &'a dyn Store, page_size: usize, max_rows: usize) -> Self {
        Self {
            store,
            page_size,
            max_rows,
            definitions: None,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, table: &str, columns: &str, order_by: &str) -> Result<Vec<T>> {
        let rows = fetch_all(
            self.store,
            table,
            Select::columns(columns),
            order_by,
            self.page_size,
            self.max_rows,
        )
        .await
        .with_context(|| format!("Failed to fetch {}", table))?;

        if rows.len() >= self.max_rows {
            warn!(table, max_rows = self.max_rows, "Lookup table reached the row cap");
        }

        rows.into_iter()
            .map(|row| serde_json::from_value(row).with_context(|| format!("Unexpected row in {}", table)))
            .collect()
    }

    /// indicator id → name, fetched once per resolver.
    async fn definitions(&mut self) -> Result<&HashMap<i64, String>> {
        if self.definitions.is_none() {
            let rows: Vec<NamedRow> = self.fetch(IndicatorDefinition::NAME, "id,nombre", "id").await?;
            let map = rows
                .into_iter()
                .filter_map(|r| r.nombre.map(|n| (r.id, n)))
                .collect::<HashMap<_, _>>();
            info!(indicators = map.len(), "Loaded indicator definitions");
            self.definitions = Some(map);
        }
        Ok(self.definitions.get_or_insert_with(HashMap::new))
    }

    async fn via_components(&mut self) -> Result<BTreeMap<i64, String>> {
        let links: Vec<ComponentLink> = self
            .fetch(ComponentLink::NAME, "id_componente,id_resultado", "id_resultado")
            .await?;
        if links.is_empty() {
            return Ok(BTreeMap::new());
        }
        let components: Vec<IndicatorRef> = self
            .fetch(IndicatorComponent::NAME, "id,id_indicador", "id")
            .await?;
        let definitions = self.definitions().await?;
        Ok(map_via_components(&links, &indicator_refs(components), definitions))
    }

    async fn via_raw_data(&mut self) -> Result<BTreeMap<i64, String>> {
        let links: Vec<RawDataLink> = self
            .fetch(RawDataLink::NAME, "id_resultado,id_dato_bruto", "id_resultado")
            .await?;
        if links.is_empty() {
            return Ok(BTreeMap::new());
        }
        let raw: Vec<IndicatorRef> = self.fetch(RawDatum::NAME, "id,id_indicador", "id").await?;
        let definitions = self.definitions().await?;
        Ok(map_via_raw_data(&links, &indicator_refs(raw), definitions))
    }

    pub async fn resolve(&mut self, schema: SchemaVersion) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        for &strategy in Strategy::plan(schema) {
            resolution.attempted.push(strategy);
            let names = match strategy {
                Strategy::Components => self.via_components().await?,
                Strategy::RawData => self.via_raw_data().await?,
            };
            info!(%strategy, mapped = names.len(), "Resolution strategy finished");
            if !names.is_empty() {
                resolution.strategy = Some(strategy);
                resolution.names = names;
                break;
            }
        }
        Ok(resolution)
    }
}

fn indicator_refs(rows: Vec<IndicatorRef>) -> HashMap<i64, i64> {
    rows.into_iter()
        .filter_map(|r| r.id_indicador.map(|ind| (r.id, ind)))
        .collect()
}

/// Attach the lowest linked indicator id to each result, then name it.
fn name_results(
    pairs: impl Iterator<Item = (i64, i64)>,
    definitions: &HashMap<i64, String>,
) -> BTreeMap<i64, String> {
    let mut indicator_of: BTreeMap<i64, i64> = BTreeMap::new();
    for (result, indicator) in pairs {
        indicator_of
            .entry(result)
            .and_modify(|current| *current = (*current).min(indicator))
            .or_insert(indicator);
    }
    indicator_of
        .into_iter()
        .filter_map(|(result, indicator)| definitions.get(&indicator).map(|n| (result, n.clone())))
        .collect()
}

/// result → component → indicator → name
pub fn map_via_components(
    links: &[ComponentLink],
    component_indicator: &HashMap<i64, i64>,
    definitions: &HashMap<i64, String>,
) -> BTreeMap<i64, String> {
    name_results(
        links.iter().filter_map(|l| {
            component_indicator
                .get(&l.id_componente)
                .map(|&ind| (l.id_resultado, ind))
        }),
        definitions,
    )
}

/// result → raw datum → indicator → name
pub fn map_via_raw_data(
    links: &[RawDataLink],
    raw_indicator: &HashMap<i64, i64>,
    definitions: &HashMap<i64, String>,
) -> BTreeMap<i64, String> {
    name_results(
        links.iter().filter_map(|l| {
            raw_indicator
                .get(&l.id_dato_bruto)
                .map(|&ind| (l.id_resultado, ind))
        }),
        definitions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::store::MemoryStore;
    use serde_json::json;

    fn definitions() -> HashMap<i64, String> {
        HashMap::from([
            (3, "Conectividad".to_string()),
            (7, "Uso de IA".to_string()),
        ])
    }

    #[test]
    fn test_plan_by_schema_version() {
        assert_eq!(Strategy::plan(SchemaVersion::V1), &[Strategy::RawData]);
        assert_eq!(Strategy::plan(SchemaVersion::V2), &[Strategy::Components]);
        assert_eq!(
            Strategy::plan(SchemaVersion::Auto),
            &[Strategy::Components, Strategy::RawData]
        );
    }

    #[test]
    fn test_map_via_components() {
        let links = vec![
            ComponentLink { id_componente: 10, id_resultado: 5000001 },
            ComponentLink { id_componente: 11, id_resultado: 5000002 },
            ComponentLink { id_componente: 99, id_resultado: 5000003 },
        ];
        let components = HashMap::from([(10, 3), (11, 7)]);
        let names = map_via_components(&links, &components, &definitions());
        assert_eq!(names.len(), 2);
        assert_eq!(names[&5000001], "Conectividad");
        assert_eq!(names[&5000002], "Uso de IA");
    }

    #[test]
    fn test_lowest_indicator_id_wins() {
        let links = vec![
            RawDataLink { id_resultado: 1, id_dato_bruto: 100 },
            RawDataLink { id_resultado: 1, id_dato_bruto: 101 },
        ];
        let raw = HashMap::from([(100, 7), (101, 3)]);
        let names = map_via_raw_data(&links, &raw, &definitions());
        assert_eq!(names[&1], "Conectividad");
    }

    #[test]
    fn test_unnamed_indicator_is_not_mapped() {
        let links = vec![RawDataLink { id_resultado: 1, id_dato_bruto: 100 }];
        let raw = HashMap::from([(100, 42)]);
        assert!(map_via_raw_data(&links, &raw, &definitions()).is_empty());
    }

    fn seed_definitions(store: &MemoryStore) {
        store.seed(
            "definicion_indicadores",
            vec![
                json!({"id": 3, "nombre": "Conectividad"}),
                json!({"id": 7, "nombre": "Uso de IA"}),
            ],
        );
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_raw_data() {
        let store = MemoryStore::new();
        seed_definitions(&store);
        store.seed(
            "resultado_datos_brutos",
            vec![json!({"id_resultado": 5000001, "id_dato_bruto": 1})],
        );
        store.seed("datos_brutos", vec![json!({"id": 1, "id_indicador": 7})]);

        let mut resolver = NameResolver::new(&store, 1000, 50_000);
        let resolution = resolver.resolve(SchemaVersion::Auto).await.unwrap();
        assert_eq!(
            resolution.attempted,
            vec![Strategy::Components, Strategy::RawData]
        );
        assert_eq!(resolution.strategy, Some(Strategy::RawData));
        assert_eq!(resolution.names[&5000001], "Uso de IA");
    }

    #[tokio::test]
    async fn test_auto_stops_at_components_when_mapped() {
        let store = MemoryStore::new();
        seed_definitions(&store);
        store.seed(
            "componente_resultado",
            vec![json!({"id_componente": 10, "id_resultado": 5000001})],
        );
        store.seed("componentes_indicador", vec![json!({"id": 10, "id_indicador": 3})]);
        store.seed(
            "resultado_datos_brutos",
            vec![json!({"id_resultado": 5000001, "id_dato_bruto": 1})],
        );
        store.seed("datos_brutos", vec![json!({"id": 1, "id_indicador": 7})]);

        let mut resolver = NameResolver::new(&store, 1000, 50_000);
        let resolution = resolver.resolve(SchemaVersion::Auto).await.unwrap();
        assert_eq!(resolution.attempted, vec![Strategy::Components]);
        assert_eq!(resolution.names[&5000001], "Conectividad");
    }

    #[tokio::test]
    async fn test_v2_does_not_fall_back() {
        let store = MemoryStore::new();
        seed_definitions(&store);
        store.seed(
            "resultado_datos_brutos",
            vec![json!({"id_resultado": 5000001, "id_dato_bruto": 1})],
        );
        store.seed("datos_brutos", vec![json!({"id": 1, "id_indicador": 7})]);

        let mut resolver = NameResolver::new(&store, 1000, 50_000);
        let resolution = resolver.resolve(SchemaVersion::V2).await.unwrap();
        assert!(resolution.is_empty());
        assert_eq!(resolution.strategy, None);
    }

    #[tokio::test]
    async fn test_empty_store_maps_nothing() {
        let store = MemoryStore::new();
        let mut resolver = NameResolver::new(&store, 1000, 50_000);
        let resolution = resolver.resolve(SchemaVersion::Auto).await.unwrap();
        assert!(resolution.is_empty());
        assert_eq!(resolution.attempted.len(), 2);
    }
}
