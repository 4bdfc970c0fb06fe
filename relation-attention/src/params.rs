//! Scoped parameter storage.
//!
//! Layers obtain their parameters through a [`VarBuilder`] that is rooted
//! at a named scope of a [`ParamStore`]. Creating a scope twice is an error
//! unless the caller explicitly asks to reuse the parameters of an existing
//! scope, so parameters are never shared by accident.
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::{Init, VarBuilder, VarMap};
use snafu::{ensure, Snafu};

/// Whether a scope creates new parameters or reuses existing ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reuse {
    /// Create fresh parameters, the scope must not exist yet.
    #[default]
    New,

    /// Reuse the parameters of a scope that was created before.
    Existing,
}

impl From<bool> for Reuse {
    fn from(reuse: bool) -> Self {
        if reuse {
            Reuse::Existing
        } else {
            Reuse::New
        }
    }
}

/// Errors for scoped parameter access.
#[derive(Debug, Snafu)]
pub enum ParamStoreError {
    #[snafu(display("Parameter scope name must not be empty"))]
    EmptyScope,

    #[snafu(display("Parameter scope '{scope}' overlaps with existing scope '{existing}'"))]
    NestedScope { scope: String, existing: String },

    #[snafu(display("Parameter scope '{scope}' already exists, request reuse to share it"))]
    ScopeExists { scope: String },

    #[snafu(display("Cannot reuse parameter scope '{scope}', it was never created"))]
    UnknownScope { scope: String },
}

/// Store of trainable parameters, addressed by scope.
///
/// Parameters live in a [`VarMap`], so that they can be handed to an
/// optimizer through [`ParamStore::all_vars`].
pub struct ParamStore {
    device: Device,
    dtype: DType,
    scopes: Mutex<HashSet<String>>,
    varmap: VarMap,
}

impl ParamStore {
    /// Create an empty parameter store.
    ///
    /// * `dtype` - Data type of created parameters.
    /// * `device` - Device on which parameters are allocated.
    pub fn new(dtype: DType, device: &Device) -> Self {
        ParamStore {
            device: device.clone(),
            dtype,
            scopes: Mutex::new(HashSet::new()),
            varmap: VarMap::new(),
        }
    }

    /// Get a variable builder for the given scope.
    ///
    /// With [`Reuse::New`] the scope is registered and layers built with
    /// the returned builder create new parameters. A new scope must not be
    /// nested in, or contain, another scope. With [`Reuse::Existing`]
    /// the builder resolves to the parameters that were created for the
    /// scope earlier, requesting a parameter that does not exist is an
    /// error.
    pub fn scope(&self, name: &str, reuse: Reuse) -> Result<VarBuilder<'static>, ParamStoreError> {
        ensure!(!name.is_empty(), EmptyScopeSnafu);

        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        let vb = match reuse {
            Reuse::New => {
                ensure!(!scopes.contains(name), ScopeExistsSnafu { scope: name });
                if let Some(existing) = scopes.iter().find(|existing| nested(existing, name)) {
                    return NestedScopeSnafu {
                        scope: name,
                        existing: existing.as_str(),
                    }
                    .fail();
                }
                if let Some(existing) = self.var_under(name) {
                    return NestedScopeSnafu {
                        scope: name,
                        existing,
                    }
                    .fail();
                }

                scopes.insert(name.to_string());
                tracing::debug!(scope = name, "created parameter scope");
                VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
            }
            Reuse::Existing => {
                ensure!(scopes.contains(name), UnknownScopeSnafu { scope: name });
                tracing::debug!(scope = name, "reusing parameter scope");
                VarBuilder::from_backend(
                    Box::new(ExistingVars(self.varmap.clone())),
                    self.dtype,
                    self.device.clone(),
                )
            }
        };

        Ok(vb.push_prefix(name))
    }

    /// Name of a stored parameter inside the given scope.
    fn var_under(&self, scope: &str) -> Option<String> {
        let prefix = format!("{scope}.");
        self.varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .find(|key| key.starts_with(&prefix))
            .cloned()
    }

    /// Check whether a scope was created.
    pub fn contains_scope(&self, name: &str) -> bool {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// All trainable variables in the store.
    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Device on which parameters are allocated.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Data type of the parameters.
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Whether one scope contains the other.
fn nested(a: &str, b: &str) -> bool {
    let is_prefix = |outer: &str, inner: &str| {
        inner.len() > outer.len()
            && inner.starts_with(outer)
            && inner.as_bytes()[outer.len()] == b'.'
    };
    is_prefix(a, b) || is_prefix(b, a)
}

/// Backend that only resolves parameters that already exist.
struct ExistingVars(VarMap);

impl SimpleBackend for ExistingVars {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _h: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        let data = self.0.data().lock().unwrap_or_else(PoisonError::into_inner);
        let tensor = match data.get(name) {
            Some(var) => var.as_tensor(),
            None => {
                return Err(candle_core::Error::CannotFindTensor {
                    path: name.to_string(),
                }
                .bt())
            }
        };
        if tensor.shape() != &s {
            candle_core::bail!(
                "shape mismatch for reused parameter {name}, expected {s:?}, got {:?}",
                tensor.shape()
            );
        }
        tensor.to_dtype(dtype)?.to_device(dev)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.0
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::Init;
    use rstest::rstest;

    use super::{ParamStore, ParamStoreError, Reuse};
    use crate::layers::activation::Activation;
    use crate::layers::attention::EntityAttentionConfig;
    use crate::layers::dense::Dense;

    #[test]
    fn nested_scopes_are_rejected() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        EntityAttentionConfig::default()
            .input_width(6)
            .attention_size(4)
            .build(store.scope("entity", Reuse::New).unwrap())
            .unwrap();
        let n_vars = store.all_vars().len();

        assert!(matches!(
            store.scope("entity.attn", Reuse::New),
            Err(ParamStoreError::NestedScope { scope, existing })
                if scope == "entity.attn" && existing == "entity"
        ));
        assert!(matches!(
            store.scope("entity.ln.weight", Reuse::New),
            Err(ParamStoreError::NestedScope { .. })
        ));
        assert_eq!(store.all_vars().len(), n_vars);

        // An enclosing scope would also see the parameters of `entity`.
        store.scope("outer.inner", Reuse::New).unwrap();
        assert!(matches!(
            store.scope("outer", Reuse::New),
            Err(ParamStoreError::NestedScope { existing, .. }) if existing == "outer.inner"
        ));

        // Sharing a name prefix without a separator is not nesting.
        store.scope("entity_types", Reuse::New).unwrap();
        let projection = Dense::new(
            store.scope("entity2", Reuse::New).unwrap().push_prefix("attn"),
            6,
            4,
            Some(Activation::Relu),
        )
        .unwrap();
        assert_eq!(projection.output_width(), 4);
        assert_eq!(store.all_vars().len(), n_vars + 2);
    }

    #[test]
    fn scope_with_stored_parameters_is_not_recreated() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        store
            .scope("encoder", Reuse::New)
            .unwrap()
            .push_prefix("layer")
            .get_with_hints(3, "bias", Init::Const(0.))
            .unwrap();
        assert!(matches!(
            store.scope("encoder.layer", Reuse::New),
            Err(ParamStoreError::NestedScope { .. })
        ));
    }

    #[test]
    fn reused_scope_does_not_create_parameters() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        store
            .scope("projection", Reuse::New)
            .unwrap()
            .get_with_hints((2, 3), "weight", Init::Const(0.5))
            .unwrap();

        let reused = store.scope("projection", Reuse::Existing).unwrap();
        assert!(reused
            .get_with_hints(3, "bias", Init::Const(0.))
            .is_err());
        assert!(reused
            .get_with_hints((3, 2), "weight", Init::Const(0.))
            .is_err());
        assert_eq!(store.all_vars().len(), 1);
    }

    #[test]
    fn scopes_use_store_device_and_dtype() {
        let store = ParamStore::new(DType::F64, &Device::Cpu);
        assert_eq!(store.dtype(), DType::F64);
        assert!(store.device().is_cpu());

        let weight = store
            .scope("projection", Reuse::New)
            .unwrap()
            .get_with_hints((2, 2), "weight", Init::Const(1.))
            .unwrap();
        assert_eq!(weight.dtype(), store.dtype());
        assert!(store.contains_scope("projection"));
    }

    #[test]
    fn creating_scope_twice_fails() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        assert!(store.scope("attention", Reuse::New).is_ok());
        assert!(matches!(
            store.scope("attention", Reuse::New),
            Err(ParamStoreError::ScopeExists { scope }) if scope == "attention"
        ));
    }

    #[test]
    fn reusing_unknown_scope_fails() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        assert!(matches!(
            store.scope("attention", Reuse::Existing),
            Err(ParamStoreError::UnknownScope { .. })
        ));
        assert!(!store.contains_scope("attention"));
    }

    #[test]
    fn reused_scope_resolves_to_same_parameters() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let created = store
            .scope("projection", Reuse::New)
            .unwrap()
            .get_with_hints((2, 3), "weight", Init::Const(0.5))
            .unwrap();
        // The initializer is ignored for parameters that already exist.
        let reused = store
            .scope("projection", Reuse::Existing)
            .unwrap()
            .get_with_hints((2, 3), "weight", Init::Const(0.0))
            .unwrap();

        assert_eq!(
            created.to_vec2::<f32>().unwrap(),
            reused.to_vec2::<f32>().unwrap()
        );
        assert_eq!(store.all_vars().len(), 1);
    }

    #[rstest]
    #[case(false, Reuse::New)]
    #[case(true, Reuse::Existing)]
    fn reuse_from_flag(#[case] flag: bool, #[case] reuse: Reuse) {
        assert_eq!(Reuse::from(flag), reuse);
    }

    #[test]
    fn empty_scope_is_rejected() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        assert!(matches!(
            store.scope("", Reuse::New),
            Err(ParamStoreError::EmptyScope)
        ));
    }
}
