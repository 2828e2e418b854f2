//! SPARQL pattern engine backed by an in-memory oxigraph store.
//!
//! Each query loads the snapshot into a fresh store. Individuals, classes and
//! properties become IRIs under one namespace; data attributes become typed
//! literals so numeric `FILTER`s compare as numbers.

use oxigraph::model::vocab::rdf;
use oxigraph::model::{GraphName, Literal as RdfLiteral, NamedNode, Quad, Term};
use oxigraph::sparql::QueryResults;
use oxigraph::store::Store;

use crate::assertion::{Assertion, Literal};
use crate::fact_store::FactSnapshot;
use crate::pattern::{Binding, Bindings, PatternEngine, PatternEngineError, PatternQuery};

/// Default namespace for catalog individuals.
pub const DEFAULT_NAMESPACE: &str = "http://semshop.example/onto#";

pub struct OxigraphEngine {
    namespace: String,
}

impl Default for OxigraphEngine {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl OxigraphEngine {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn iri(&self, local: &str) -> Result<NamedNode, PatternEngineError> {
        NamedNode::new(format!("{}{}", self.namespace, percent_encode(local)))
            .map_err(|e| PatternEngineError::Engine(format!("invalid IRI for {local:?}: {e}")))
    }

    fn load(&self, facts: &FactSnapshot) -> Result<Store, PatternEngineError> {
        let store = Store::new()
            .map_err(|e| PatternEngineError::Engine(format!("failed to create oxigraph store: {e}")))?;

        for assertion in facts.assertions() {
            let quad = match assertion {
                Assertion::ClassMembership { individual, class } => Quad::new(
                    self.iri(individual)?,
                    rdf::TYPE,
                    self.iri(class)?,
                    GraphName::DefaultGraph,
                ),
                Assertion::ObjectRelation {
                    subject,
                    relation,
                    object,
                } => Quad::new(
                    self.iri(subject)?,
                    self.iri(relation)?,
                    self.iri(object)?,
                    GraphName::DefaultGraph,
                ),
                Assertion::DataAttribute {
                    individual,
                    attribute,
                    value,
                } => Quad::new(
                    self.iri(individual)?,
                    self.iri(attribute)?,
                    rdf_literal(value),
                    GraphName::DefaultGraph,
                ),
            };
            store
                .insert(&quad)
                .map_err(|e| PatternEngineError::Engine(format!("insert failed: {e}")))?;
        }
        Ok(store)
    }

    fn binding(&self, term: &Term) -> Binding {
        match term {
            Term::NamedNode(node) => {
                let iri = node.as_str();
                match iri.strip_prefix(self.namespace.as_str()) {
                    Some(local) => Binding::Name(percent_decode(local)),
                    None => Binding::Iri(iri.to_string()),
                }
            }
            Term::BlankNode(node) => Binding::Blank(node.as_str().to_string()),
            Term::Literal(literal) => Binding::Literal(literal.value().to_string()),
            #[allow(unreachable_patterns)]
            other => Binding::Literal(other.to_string()),
        }
    }
}

impl PatternEngine for OxigraphEngine {
    fn execute(
        &self,
        query: &PatternQuery,
        facts: &FactSnapshot,
    ) -> Result<Vec<Bindings>, PatternEngineError> {
        let store = self.load(facts)?;

        #[allow(deprecated)]
        let results = store
            .query(query.text())
            .map_err(|e| PatternEngineError::Engine(format!("SPARQL query failed: {e}")))?;

        match results {
            QueryResults::Solutions(solutions) => {
                let mut rows = Vec::new();
                for solution in solutions {
                    let solution = solution
                        .map_err(|e| PatternEngineError::Engine(format!("solution error: {e}")))?;
                    let row = solution
                        .iter()
                        .map(|(var, term)| (var.as_str().to_string(), self.binding(term)))
                        .collect();
                    rows.push(row);
                }
                Ok(rows)
            }
            QueryResults::Boolean(b) => Ok(vec![vec![(
                "result".to_string(),
                Binding::Literal(b.to_string()),
            )]]),
            QueryResults::Graph(_) => Err(PatternEngineError::Engine(
                "CONSTRUCT/DESCRIBE results are not supported".into(),
            )),
        }
    }
}

fn rdf_literal(value: &Literal) -> RdfLiteral {
    match value {
        Literal::Text(s) => RdfLiteral::new_simple_literal(s.as_str()),
        Literal::Number(n) => RdfLiteral::from(*n),
        Literal::Integer(i) => RdfLiteral::from(*i),
        Literal::Boolean(b) => RdfLiteral::from(*b),
    }
}

fn percent_encode(local: &str) -> String {
    let mut out = String::with_capacity(local.len());
    for c in local.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    out
}

fn percent_decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            if let Ok(byte) = u8::from_str_radix(&encoded[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KnowledgeBase, NoInference, QueryGateway};

    fn catalog_kb() -> KnowledgeBase {
        let kb = KnowledgeBase::open_in_memory(NoInference).unwrap();
        kb.apply(
            &crate::ChangeSet::new()
                .assert(Assertion::class_membership("phone1", "Product"))
                .assert(Assertion::object_relation("phone1", "hasBrand", "Acme"))
                .assert(Assertion::data_attribute("phone1", "stock", 2_i64))
                .assert(Assertion::data_attribute("phone1", "name", "Acme One"))
                .assert(Assertion::class_membership("laptops/x 2#blue", "Product"))
                .assert(Assertion::data_attribute("laptops/x 2#blue", "stock", 30_i64)),
        )
        .unwrap();
        kb
    }

    #[test]
    fn select_filters_on_typed_literals() {
        let kb = catalog_kb();
        let gw = QueryGateway::new(Box::new(OxigraphEngine::default()));
        let rows = gw
            .run_query(
                &kb,
                "PREFIX : <http://semshop.example/onto#>\n\
                 SELECT ?p ?stock WHERE { ?p a :Product ; :stock ?stock . FILTER(?stock < 5) }",
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["p"], "phone1");
        assert_eq!(rows[0]["stock"], "2");
    }

    #[test]
    fn ids_with_spaces_and_separators_round_trip() {
        let kb = catalog_kb();
        let gw = QueryGateway::new(Box::new(OxigraphEngine::default()));
        let rows = gw
            .run_query(
                &kb,
                "PREFIX :<http://semshop.example/onto#>\n\
                 SELECT ?p WHERE { ?p :stock 30 }",
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["p"], "laptops/x 2#blue");
    }

    #[test]
    fn ask_yields_single_result_row() {
        let kb = catalog_kb();
        let gw = QueryGateway::new(Box::new(OxigraphEngine::default()));
        let rows = gw
            .run_query(
                &kb,
                "PREFIX : <http://semshop.example/onto#>\nASK { :phone1 :hasBrand :Acme }",
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["result"], "true");
    }

    #[test]
    fn engine_syntax_errors_surface_as_query_execution() {
        let kb = catalog_kb();
        let gw = QueryGateway::new(Box::new(OxigraphEngine::default()));
        let err = gw
            .run_query(&kb, "SELECT ?p WHERE { ?p nope:missing ?o }")
            .unwrap_err();
        assert!(matches!(err, crate::KbError::QueryExecution(_)));
    }

    #[test]
    fn percent_encoding_is_reversible() {
        let raw = "laptop 2/é";
        assert_eq!(percent_decode(&percent_encode(raw)), raw);
        assert_eq!(percent_encode("phone1"), "phone1");
    }
}
