//! The nested query language: a JSON-described algebra of set
//! operations that composes sketches recursively, e.g.
//! `Jaccard(key1 ∪ key2, key8 ∩ key3)`.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::sketch::{self, Sketch};
use crate::store::StoreHandle;

/// One node of a query tree. Exactly one of `keys`/`set` must be
/// present; enforced in `evaluate`, not at the type level, since the
/// wire format allows either field to be omitted or present.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Query {
    pub method: String,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub set: Option<Vec<Query>>,
}

/// A jaccard pairing produced by `correlation`.
#[derive(Debug, Clone, Serialize)]
pub struct Pairing {
    pub keys: [String; 2],
    pub jaccard: f64,
}

/// The result of evaluating one query node: a display name plus
/// exactly one of a sketch, a scalar, or a `correlation` pairing list.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sketch: Option<SketchView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi: Option<Vec<Pairing>>,
}

/// A JSON-friendly view of a sketch's contents, used only for display.
#[derive(Debug, Clone, Serialize)]
pub struct SketchView {
    pub k: usize,
    pub values: Vec<u64>,
}

impl From<&Sketch> for SketchView {
    fn from(s: &Sketch) -> Self {
        SketchView {
            k: s.capacity(),
            values: s.values().to_vec(),
        }
    }
}

/// A resolved child: either a sketch, or a pure scalar (a `cardinality`
/// result nested inside a `set`, say), each tagged with a display name.
enum Child {
    Sketch(String, Sketch),
    Num(String, f64),
}

impl Child {
    fn into_sketch(self) -> Result<(String, Sketch), Error> {
        match self {
            Child::Sketch(k, s) => Ok((k, s)),
            Child::Num(_, _) => Err(Error::QueryShape("set needs a sketch".into())),
        }
    }
}

/// Evaluates a query tree against the store, fanning out leaf `Get`s
/// concurrently (each on its own task, joined back up in request order)
/// and composing sketch combinators in-process for interior nodes.
pub async fn evaluate(store: &StoreHandle, query: &Query) -> Result<QueryResult, Error> {
    match (&query.keys, &query.set) {
        (Some(_), Some(_)) => {
            return Err(Error::QueryShape(
                "query contains both keys and set".into(),
            ))
        }
        (None, None) => {
            return Err(Error::QueryShape(
                "query contains neither keys nor set".into(),
            ))
        }
        _ => {}
    }

    let children = resolve_children(store, query).await?;
    dispatch(&query.method, children)
}

async fn resolve_children(store: &StoreHandle, query: &Query) -> Result<Vec<Child>, Error> {
    if let Some(keys) = &query.keys {
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys.clone() {
            let store = store.clone();
            handles.push(tokio::spawn(async move { fetch_leaf(&store, &key).await }));
        }
        let mut children = Vec::with_capacity(handles.len());
        for handle in handles {
            children.push(handle.await.map_err(|_| Error::Shutdown)??);
        }
        Ok(children)
    } else if let Some(set) = &query.set {
        let mut children = Vec::with_capacity(set.len());
        for nested in set {
            let result = Box::pin(evaluate(store, nested)).await?;
            children.push(result_to_child(result)?);
        }
        Ok(children)
    } else {
        unreachable!("validated by evaluate")
    }
}

async fn fetch_leaf(store: &StoreHandle, key: &str) -> Result<Child, Error> {
    let sketch = store.get(key).await?;
    Ok(Child::Sketch(key.to_string(), sketch))
}

fn result_to_child(result: QueryResult) -> Result<Child, Error> {
    if let Some(num) = result.num {
        Ok(Child::Num(result.key, num))
    } else if let Some(view) = result.sketch {
        Ok(Child::Sketch(result.key, Sketch::from_parts(view.k, view.values)))
    } else {
        Err(Error::QueryShape(
            "nested query produced neither a sketch nor a scalar".into(),
        ))
    }
}

fn dispatch(method: &str, children: Vec<Child>) -> Result<QueryResult, Error> {
    match method {
        "get" => {
            require_arity(&children, 1, 1, method)?;
            let (key, sketch) = children.into_iter().next().unwrap().into_sketch()?;
            Ok(QueryResult {
                key,
                sketch: Some(SketchView::from(&sketch)),
                num: None,
                multi: None,
            })
        }
        "cardinality" => {
            require_arity(&children, 1, 1, method)?;
            let (key, sketch) = children.into_iter().next().unwrap().into_sketch()?;
            Ok(QueryResult {
                key: format!("cardinality({})", key),
                sketch: None,
                num: Some(sketch.cardinality()),
                multi: None,
            })
        }
        "union" => {
            require_arity(&children, 2, usize::MAX, method)?;
            let (display, sketches) = names_and_sketches(children)?;
            let refs: Vec<&Sketch> = sketches.iter().collect();
            let u = sketch::union(&refs);
            Ok(QueryResult {
                key: format!("union({})", display.join(", ")),
                sketch: Some(SketchView::from(&u)),
                num: None,
                multi: None,
            })
        }
        "jaccard" => {
            require_arity(&children, 2, usize::MAX, method)?;
            let (display, sketches) = names_and_sketches(children)?;
            let refs: Vec<&Sketch> = sketches.iter().collect();
            Ok(QueryResult {
                key: format!("jaccard({})", display.join(", ")),
                sketch: None,
                num: Some(sketch::jaccard(&refs)),
                multi: None,
            })
        }
        "cardinality_union" => {
            require_arity(&children, 2, usize::MAX, method)?;
            let (display, sketches) = names_and_sketches(children)?;
            let refs: Vec<&Sketch> = sketches.iter().collect();
            Ok(QueryResult {
                key: format!("cardinality_union({})", display.join(", ")),
                sketch: None,
                num: Some(sketch::cardinality_union(&refs)),
                multi: None,
            })
        }
        "cardinality_intersection" => {
            require_arity(&children, 2, usize::MAX, method)?;
            let (display, sketches) = names_and_sketches(children)?;
            let refs: Vec<&Sketch> = sketches.iter().collect();
            Ok(QueryResult {
                key: format!("cardinality_intersection({})", display.join(", ")),
                sketch: None,
                num: Some(sketch::cardinality_intersection(&refs)),
                multi: None,
            })
        }
        "correlation" => {
            require_arity(&children, 2, usize::MAX, method)?;
            let (display, sketches) = names_and_sketches(children)?;
            let mut pairs = Vec::new();
            for i in 0..sketches.len() {
                for j in (i + 1)..sketches.len() {
                    let j_val = sketch::jaccard(&[&sketches[i], &sketches[j]]);
                    pairs.push(Pairing {
                        keys: [display[i].clone(), display[j].clone()],
                        jaccard: j_val,
                    });
                }
            }
            Ok(QueryResult {
                key: format!("correlation({})", display.join(", ")),
                sketch: None,
                num: None,
                multi: Some(pairs),
            })
        }
        other => Err(Error::QueryShape(format!("unknown method: {}", other))),
    }
}

fn require_arity(children: &[Child], min: usize, max: usize, method: &str) -> Result<(), Error> {
    if children.len() < min || children.len() > max {
        return Err(Error::QueryShape(format!(
            "method {} requires between {} and {} children, got {}",
            method,
            min,
            max,
            children.len()
        )));
    }
    Ok(())
}

fn names_and_sketches(children: Vec<Child>) -> Result<(Vec<String>, Vec<Sketch>), Error> {
    let mut names = Vec::with_capacity(children.len());
    let mut sketches = Vec::with_capacity(children.len());
    for child in children {
        let (name, sketch) = child.into_sketch()?;
        names.push(name);
        sketches.push(sketch);
    }
    Ok((names, sketches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Command, StorePool};

    fn open_pool() -> (StorePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = StorePool::open(dir.path(), 1 << 20, 1000, 1, 8).unwrap();
        (pool, dir)
    }

    async fn seed(handle: &crate::store::StoreHandle, key: &str, hashes: impl Iterator<Item = u64>) {
        for h in hashes {
            handle
                .submit(Command::AddHash {
                    key: key.to_string(),
                    hash: h,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn get_leaf_returns_sketch_view() {
        let (pool, _dir) = open_pool();
        let handle = pool.handle();
        seed(&handle, "a", 0..10u64).await;

        let q = Query {
            method: "get".into(),
            keys: Some(vec!["a".into()]),
            set: None,
        };
        let result = evaluate(&handle, &q).await.unwrap();
        assert_eq!(result.key, "a");
        assert_eq!(result.sketch.unwrap().values.len(), 10);
        pool.shutdown();
    }

    #[tokio::test]
    async fn cardinality_of_missing_key_is_zero() {
        let (pool, _dir) = open_pool();
        let handle = pool.handle();
        let q = Query {
            method: "cardinality".into(),
            keys: Some(vec!["missing".into()]),
            set: None,
        };
        let result = evaluate(&handle, &q).await.unwrap();
        assert_eq!(result.num, Some(0.0));
        pool.shutdown();
    }

    #[tokio::test]
    async fn union_of_two_keys_matches_direct_sketch_union() {
        let (pool, _dir) = open_pool();
        let handle = pool.handle();
        seed(&handle, "a", 0..50u64).await;
        seed(&handle, "b", 25..75u64).await;

        let q = Query {
            method: "union".into(),
            keys: Some(vec!["a".into(), "b".into()]),
            set: None,
        };
        let result = evaluate(&handle, &q).await.unwrap();
        let view = result.sketch.unwrap();
        assert!(view.values.len() <= view.k);
        pool.shutdown();
    }

    #[tokio::test]
    async fn jaccard_nested_inside_set_composes() {
        let (pool, _dir) = open_pool();
        let handle = pool.handle();
        seed(&handle, "a", 0..100u64).await;
        seed(&handle, "b", 0..100u64).await;
        seed(&handle, "c", 50..150u64).await;

        // jaccard(union(a, b), c)
        let q = Query {
            method: "jaccard".into(),
            keys: None,
            set: Some(vec![
                Query {
                    method: "union".into(),
                    keys: Some(vec!["a".into(), "b".into()]),
                    set: None,
                },
                Query {
                    method: "get".into(),
                    keys: Some(vec!["c".into()]),
                    set: None,
                },
            ]),
        };
        let result = evaluate(&handle, &q).await.unwrap();
        assert!(result.num.is_some());
        pool.shutdown();
    }

    #[tokio::test]
    async fn correlation_returns_all_pairs() {
        let (pool, _dir) = open_pool();
        let handle = pool.handle();
        seed(&handle, "a", 0..20u64).await;
        seed(&handle, "b", 0..20u64).await;
        seed(&handle, "c", 10..30u64).await;

        let q = Query {
            method: "correlation".into(),
            keys: Some(vec!["a".into(), "b".into(), "c".into()]),
            set: None,
        };
        let result = evaluate(&handle, &q).await.unwrap();
        assert_eq!(result.multi.unwrap().len(), 3);
        pool.shutdown();
    }

    #[tokio::test]
    async fn keys_and_set_together_is_invalid_shape() {
        let (pool, _dir) = open_pool();
        let handle = pool.handle();
        let q = Query {
            method: "get".into(),
            keys: Some(vec!["a".into()]),
            set: Some(vec![]),
        };
        let err = evaluate(&handle, &q).await.unwrap_err();
        assert!(matches!(err, Error::QueryShape(_)));
        pool.shutdown();
    }

    #[tokio::test]
    async fn cardinality_of_union_within_relative_error() {
        use rand::Rng;
        let (pool, _dir) = open_pool();
        let handle = pool.handle();
        // disjoint populations of 1000 items each, union cardinality ~2000.
        // Hashes must be spread across the full 64-bit space for the KMV
        // estimator (which scales by v_max / 2^64) to be meaningful.
        let mut rng = rand::thread_rng();
        let test1: Vec<u64> = (0..1000).map(|_| rng.gen()).collect();
        let test2: Vec<u64> = (0..1000).map(|_| rng.gen()).collect();
        seed(&handle, "test1", test1.into_iter()).await;
        seed(&handle, "test2", test2.into_iter()).await;

        let q = Query {
            method: "cardinality".into(),
            keys: None,
            set: Some(vec![Query {
                method: "union".into(),
                keys: Some(vec!["test1".into(), "test2".into()]),
                set: None,
            }]),
        };
        let result = evaluate(&handle, &q).await.unwrap();
        let estimate = result.num.unwrap();
        // k is min(1000, 1000) = 1000 here by default size
        let err = crate::sketch::Sketch::new(1000).relative_error();
        assert!(
            (estimate - 2000.0).abs() <= err * 2000.0,
            "estimate {} too far from 2000 (err bound {})",
            estimate,
            err
        );
        pool.shutdown();
    }

    #[tokio::test]
    async fn cardinality_rejects_multiple_keys() {
        let (pool, _dir) = open_pool();
        let handle = pool.handle();
        seed(&handle, "a", 0..5u64).await;
        seed(&handle, "b", 0..5u64).await;
        let q = Query {
            method: "cardinality".into(),
            keys: Some(vec!["a".into(), "b".into()]),
            set: None,
        };
        let err = evaluate(&handle, &q).await.unwrap_err();
        assert!(matches!(err, Error::QueryShape(_)));
        pool.shutdown();
    }
}
