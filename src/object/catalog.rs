//! Registry of constructible object types and loadable modules.
//!
//! Core types register themselves through the distributed slice at link
//! time; modules contribute additional types when loaded, which is how the
//! denoiser becomes available only after an explicit load.

use crate::object::{CameraModel, Detail, ObjectKind, RendererFlavor};
use dashmap::{DashMap, DashSet};
use tracing::debug;

/// Zero-argument constructor producing the kind-specific state for a type
pub type ObjectCtor = fn() -> Detail;

/// Registration hook contributed by each module of builtin types
#[linkme::distributed_slice]
pub static OBJECT_TYPES: [fn(&TypeCatalog)] = [..];

/// Constructible type names, keyed by kind plus name. Materials live in a
/// separate table because their identity is the renderer/material pair.
pub struct TypeCatalog {
    constructors: DashMap<(ObjectKind, String), ObjectCtor>,
    materials: DashMap<String, ObjectCtor>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self {
            constructors: DashMap::new(),
            materials: DashMap::new(),
        }
    }

    /// Catalog populated with every link-time registration
    pub fn with_builtin_types() -> Self {
        let catalog = Self::new();
        for register in OBJECT_TYPES {
            register(&catalog);
        }
        catalog
    }

    pub fn register(&self, kind: ObjectKind, name: &str, ctor: ObjectCtor) {
        self.constructors.insert((kind, name.to_owned()), ctor);
    }

    pub fn register_material(&self, renderer_type: &str, material_type: &str, ctor: ObjectCtor) {
        self.materials
            .insert(format!("{renderer_type}/{material_type}"), ctor);
    }

    pub fn has(&self, kind: ObjectKind, name: &str) -> bool {
        self.constructors.contains_key(&(kind, name.to_owned()))
    }

    pub fn construct(&self, kind: ObjectKind, name: &str) -> Option<Detail> {
        self.constructors
            .get(&(kind, name.to_owned()))
            .map(|ctor| ctor())
    }

    pub fn construct_material(&self, renderer_type: &str, material_type: &str) -> Option<Detail> {
        self.materials
            .get(&format!("{renderer_type}/{material_type}"))
            .map(|ctor| ctor())
    }

    /// Registered names for one kind, sorted for stable diagnostics
    pub fn type_names(&self, kind: ObjectKind) -> Vec<String> {
        let mut names: Vec<_> = self
            .constructors
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::with_builtin_types()
    }
}

/// Outcome codes reported for module loads
pub mod load_code {
    pub const OK: i32 = 0;
    pub const UNKNOWN_MODULE: i32 = 2;
}

type ModuleInit = fn(&TypeCatalog);

/// Loadable feature modules. Loading runs the module's registration hook
/// once; repeat loads of the same module succeed without re-registering.
pub struct ModuleRegistry {
    available: DashMap<String, ModuleInit>,
    loaded: DashSet<String>,
}

impl ModuleRegistry {
    pub fn with_builtin_modules() -> Self {
        let registry = Self {
            available: DashMap::new(),
            loaded: DashSet::new(),
        };
        registry.available.insert("denoiser".to_owned(), denoiser_module);
        registry
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains(name)
    }

    /// Load a module by name, registering its types into the catalog.
    /// Returns one of the `load_code` values.
    pub fn load(&self, name: &str, catalog: &TypeCatalog) -> i32 {
        if self.loaded.contains(name) {
            return load_code::OK;
        }
        match self.available.get(name) {
            Some(init) => {
                init(catalog);
                self.loaded.insert(name.to_owned());
                debug!(module = name, "module loaded");
                load_code::OK
            }
            None => {
                debug!(module = name, "module not available");
                load_code::UNKNOWN_MODULE
            }
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtin_modules()
    }
}

fn denoiser_module(catalog: &TypeCatalog) {
    catalog.register(ObjectKind::ImageOperation, "denoiser", || {
        Detail::ImageOperation { effect: "denoiser" }
    });
}

#[linkme::distributed_slice(OBJECT_TYPES)]
static REGISTER_CORE_TYPES: fn(&TypeCatalog) = register_core_types;

fn register_core_types(catalog: &TypeCatalog) {
    use ObjectKind::*;

    catalog.register(Renderer, "scivis", || {
        Detail::Renderer(RendererFlavor::SciVis)
    });
    catalog.register(Renderer, "pathtracer", || {
        Detail::Renderer(RendererFlavor::PathTracer)
    });
    catalog.register(Renderer, "debug", || Detail::Renderer(RendererFlavor::Debug));

    catalog.register(Camera, "perspective", || {
        Detail::Camera(CameraModel::Perspective)
    });
    catalog.register(Camera, "orthographic", || {
        Detail::Camera(CameraModel::Orthographic)
    });
    catalog.register(Camera, "panoramic", || Detail::Camera(CameraModel::Panoramic));

    catalog.register(Volume, "structuredRegular", || Detail::Volume {
        topology: "structuredRegular",
    });
    catalog.register(Volume, "unstructured", || Detail::Volume {
        topology: "unstructured",
    });

    catalog.register(Geometry, "sphere", || Detail::Geometry { shape: "sphere" });
    catalog.register(Geometry, "mesh", || Detail::Geometry { shape: "mesh" });
    catalog.register(Geometry, "curve", || Detail::Geometry { shape: "curve" });

    catalog.register(Light, "ambient", || Detail::Light { variant: "ambient" });
    catalog.register(Light, "distant", || Detail::Light { variant: "distant" });
    catalog.register(Light, "sphere", || Detail::Light { variant: "sphere" });

    catalog.register(Texture, "texture2d", || Detail::Texture {
        variant: "texture2d",
    });
    catalog.register(Texture, "volume", || Detail::Texture { variant: "volume" });

    catalog.register(TransferFunction, "piecewiseLinear", || {
        Detail::TransferFunction
    });

    catalog.register(ImageOperation, "tonemapper", || Detail::ImageOperation {
        effect: "tonemapper",
    });

    catalog.register_material("scivis", "obj", || Detail::Material {
        renderer_type: "scivis".into(),
    });
    catalog.register_material("pathtracer", "obj", || Detail::Material {
        renderer_type: "pathtracer".into(),
    });
    catalog.register_material("pathtracer", "principled", || Detail::Material {
        renderer_type: "pathtracer".into(),
    });
    catalog.register_material("pathtracer", "glass", || Detail::Material {
        renderer_type: "pathtracer".into(),
    });
    catalog.register_material("pathtracer", "luminous", || Detail::Material {
        renderer_type: "pathtracer".into(),
    });
}
