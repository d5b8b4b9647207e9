//! LibXML2 FFI Wrapper Module
//!
//! Safe wrapper around the libxml2 calls needed for XML Schema validation.
//!
//! ## Thread Safety Strategy
//!
//! - **Initialization**: done once behind `std::sync::Once`; libxml2's init functions
//!   are not thread-safe.
//! - **Schema parsing**: serialized behind a process-wide lock. The libxml2 schema
//!   parser is not thread-safe.
//! - **Validation**: fully parallel. Every call creates its own validation context and
//!   only reads the shared, already compiled schema.
//!
//! ## Bundled resources
//!
//! Schemas routinely import `http://www.w3.org/2001/xml.xsd`. Locations registered
//! with [`register_bundled_resource`] are served from memory by a custom external
//! entity loader, so compiling such schemas never touches the network.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex, Once, OnceLock, PoisonError, RwLock};

use libc::{c_char, c_int, c_uint, c_void};

use crate::error::{LibXml2Error, LibXml2Result};
use crate::grammar_pool::{Grammar, GrammarDescriptor};

static LIBXML2_INIT: Once = Once::new();

/// Serializes every call into the schema parser
static SCHEMA_PARSE_LOCK: Mutex<()> = Mutex::new(());

/// The entity loader that was installed before ours
static DEFAULT_ENTITY_LOADER: OnceLock<XmlExternalEntityLoader> = OnceLock::new();

/// In-memory documents served by the entity loader, keyed by location
static BUNDLED_RESOURCES: OnceLock<RwLock<HashMap<String, CString>>> = OnceLock::new();

/// ## Opaque libxml2 structures
#[repr(C)]
pub struct XmlSchema {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaValidCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct xmlError {
    pub domain: c_int,
    pub code: c_int,
    pub message: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub str1: *const c_char,
    pub str2: *const c_char,
    pub str3: *const c_char,
    pub int1: c_int,
    pub int2: c_int,
    pub ctxt: *mut c_void,
    pub node: *mut c_void,
}

pub type XmlStructuredErrorFunc =
    Option<unsafe extern "C" fn(user_data: *mut c_void, error: *mut xmlError)>;

pub type XmlExternalEntityLoader = Option<
    unsafe extern "C" fn(url: *const c_char, id: *const c_char, ctxt: *mut c_void) -> *mut c_void,
>;

// External libxml2 FFI declarations
#[cfg_attr(target_os = "windows", link(name = "libxml2"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xml2"))]
unsafe extern "C" {
    pub fn xmlInitParser();
    pub fn xmlInitGlobals();

    pub fn xmlSchemaNewMemParserCtxt(
        buffer: *const c_char,
        size: c_int,
    ) -> *mut XmlSchemaParserCtxt;
    pub fn xmlSchemaSetParserStructuredErrors(
        ctxt: *mut XmlSchemaParserCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaParse(ctxt: *const XmlSchemaParserCtxt) -> *mut XmlSchema;
    pub fn xmlSchemaFreeParserCtxt(ctxt: *mut XmlSchemaParserCtxt);
    pub fn xmlSchemaFree(schema: *mut XmlSchema);

    pub fn xmlSchemaNewValidCtxt(schema: *const XmlSchema) -> *mut XmlSchemaValidCtxt;
    pub fn xmlSchemaFreeValidCtxt(ctxt: *mut XmlSchemaValidCtxt);
    pub fn xmlSchemaValidateFile(
        ctxt: *const XmlSchemaValidCtxt,
        file_name: *const c_char,
        options: c_uint,
    ) -> c_int;
    pub fn xmlSchemaSetValidStructuredErrors(
        ctxt: *mut XmlSchemaValidCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );

    pub fn xmlGetExternalEntityLoader() -> XmlExternalEntityLoader;
    pub fn xmlSetExternalEntityLoader(loader: XmlExternalEntityLoader);
    pub fn xmlNewStringInputStream(ctxt: *mut c_void, buffer: *const u8) -> *mut c_void;
}

/// Severity of a libxml2 diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    Warning,
    Error,
    Fatal,
}

impl DiagnosticLevel {
    fn from_raw(level: c_int) -> Self {
        match level {
            0 | 1 => DiagnosticLevel::Warning,
            2 => DiagnosticLevel::Error,
            _ => DiagnosticLevel::Fatal,
        }
    }
}

/// One message reported by libxml2, with its position when known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
}

fn positive(value: c_int) -> Option<u32> {
    u32::try_from(value).ok().filter(|v| *v > 0)
}

/// Collects structured errors into the `Vec<Diagnostic>` behind `user_data`
unsafe extern "C" fn collect_diagnostic(user_data: *mut c_void, error: *mut xmlError) {
    if user_data.is_null() || error.is_null() {
        return;
    }
    let diagnostics = unsafe { &mut *(user_data as *mut Vec<Diagnostic>) };
    let error = unsafe { &*error };

    let message = if error.message.is_null() {
        String::from("unknown libxml2 error")
    } else {
        unsafe { CStr::from_ptr(error.message) }
            .to_string_lossy()
            .trim()
            .to_string()
    };

    diagnostics.push(Diagnostic {
        level: DiagnosticLevel::from_raw(error.level),
        line: positive(error.line),
        column: positive(error.int2),
        message,
    });
}

/// Serves registered locations from memory, everything else through the default loader
unsafe extern "C" fn bundled_entity_loader(
    url: *const c_char,
    id: *const c_char,
    ctxt: *mut c_void,
) -> *mut c_void {
    if !url.is_null()
        && let Some(resources) = BUNDLED_RESOURCES.get()
    {
        let location = unsafe { CStr::from_ptr(url) }.to_string_lossy();
        let resources = resources.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(content) = resources.get(location.as_ref()) {
            // Registered buffers are never freed, so the input may borrow them
            let input = unsafe { xmlNewStringInputStream(ctxt, content.as_ptr() as *const u8) };
            if !input.is_null() {
                return input;
            }
        }
    }

    match DEFAULT_ENTITY_LOADER.get().copied().flatten() {
        Some(default_loader) => unsafe { default_loader(url, id, ctxt) },
        None => ptr::null_mut(),
    }
}

/// Serve `content` whenever libxml2 loads `location`
pub fn register_bundled_resource(location: &str, content: &[u8]) -> LibXml2Result<()> {
    let content = CString::new(content).map_err(|_| LibXml2Error::SchemaParseFailed {
        details: format!("bundled resource {} contains a NUL byte", location),
    })?;
    let resources = BUNDLED_RESOURCES.get_or_init(|| RwLock::new(HashMap::new()));
    resources
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(location.to_string())
        .or_insert(content);
    Ok(())
}

/// Thread-safe wrapper for libxml2 schema pointer with proper resource management
#[derive(Debug)]
pub struct XmlSchemaPtr {
    inner: Arc<XmlSchemaInner>,
}

#[derive(Debug)]
struct XmlSchemaInner {
    ptr: *mut XmlSchema,
    _phantom: PhantomData<XmlSchema>,
}

// Safety: a compiled xmlSchema is only read after parsing, which libxml2 allows
// from any number of threads
unsafe impl Send for XmlSchemaInner {}
unsafe impl Sync for XmlSchemaInner {}

impl XmlSchemaPtr {
    /// # Safety
    ///
    /// `ptr` must come from `xmlSchemaParse` and must not be freed by anyone else.
    pub(crate) unsafe fn from_raw(ptr: *mut XmlSchema) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        Some(XmlSchemaPtr {
            inner: Arc::new(XmlSchemaInner {
                ptr,
                _phantom: PhantomData,
            }),
        })
    }

    pub(crate) fn as_ptr(&self) -> *const XmlSchema {
        self.inner.ptr
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.ptr.is_null()
    }
}

impl Clone for XmlSchemaPtr {
    fn clone(&self) -> Self {
        XmlSchemaPtr {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for XmlSchemaInner {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                xmlSchemaFree(self.ptr);
            }
            self.ptr = ptr::null_mut();
        }
    }
}

/// A compiled schema together with the descriptor it was loaded for
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    descriptor: GrammarDescriptor,
    schema: XmlSchemaPtr,
}

impl CompiledSchema {
    pub fn new(descriptor: GrammarDescriptor, schema: XmlSchemaPtr) -> Self {
        Self { descriptor, schema }
    }

    pub fn schema(&self) -> &XmlSchemaPtr {
        &self.schema
    }
}

impl Grammar for CompiledSchema {
    fn descriptor(&self) -> &GrammarDescriptor {
        &self.descriptor
    }
}

/// Outcome of validating one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Return code 0; may still carry warnings
    Valid { diagnostics: Vec<Diagnostic> },
    /// Return code > 0, or a negative code after parse errors were reported
    Invalid {
        error_count: i32,
        diagnostics: Vec<Diagnostic>,
    },
    /// Return code < 0 with no error diagnostics to explain it
    InternalError { code: i32 },
}

impl ValidationResult {
    pub fn from_code(code: c_int, diagnostics: Vec<Diagnostic>) -> Self {
        match code {
            0 => ValidationResult::Valid { diagnostics },
            n if n > 0 => ValidationResult::Invalid {
                error_count: n,
                diagnostics,
            },
            n => {
                // libxml2 gives up with -1 on malformed documents; the parse errors say why
                let errors = diagnostics
                    .iter()
                    .filter(|d| d.level >= DiagnosticLevel::Error)
                    .count();
                if errors == 0 {
                    return ValidationResult::InternalError { code: n };
                }
                ValidationResult::Invalid {
                    error_count: i32::try_from(errors).unwrap_or(i32::MAX),
                    diagnostics,
                }
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationResult::Invalid { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationResult::InternalError { .. })
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            ValidationResult::Valid { diagnostics } | ValidationResult::Invalid { diagnostics, .. } => {
                diagnostics
            }
            ValidationResult::InternalError { .. } => &[],
        }
    }
}

/// Safe access to schema compilation and validation
pub struct LibXml2Wrapper {
    _phantom: PhantomData<()>,
}

impl LibXml2Wrapper {
    /// Initializes libxml2 on first use; cheap afterwards
    pub fn new() -> Self {
        LIBXML2_INIT.call_once(|| unsafe {
            xmlInitParser();
            xmlInitGlobals();
            let _ = DEFAULT_ENTITY_LOADER.set(xmlGetExternalEntityLoader());
            xmlSetExternalEntityLoader(Some(bundled_entity_loader));
        });

        LibXml2Wrapper {
            _phantom: PhantomData,
        }
    }

    /// Compile a schema from a memory buffer.
    ///
    /// Calls are serialized process-wide. The error carries libxml2's messages.
    pub fn parse_schema_from_memory(&self, schema_data: &[u8]) -> LibXml2Result<XmlSchemaPtr> {
        let size = c_int::try_from(schema_data.len()).map_err(|_| LibXml2Error::SchemaParseFailed {
            details: "schema too large".to_string(),
        })?;
        if size == 0 {
            return Err(LibXml2Error::SchemaParseFailed {
                details: "empty schema document".to_string(),
            });
        }

        let _guard = SCHEMA_PARSE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        unsafe {
            let parser_ctxt = xmlSchemaNewMemParserCtxt(schema_data.as_ptr() as *const c_char, size);
            if parser_ctxt.is_null() {
                return Err(LibXml2Error::MemoryAllocation);
            }

            xmlSchemaSetParserStructuredErrors(
                parser_ctxt,
                Some(collect_diagnostic),
                &mut diagnostics as *mut Vec<Diagnostic> as *mut c_void,
            );
            let schema_ptr = xmlSchemaParse(parser_ctxt);
            xmlSchemaFreeParserCtxt(parser_ctxt);

            XmlSchemaPtr::from_raw(schema_ptr).ok_or_else(|| LibXml2Error::SchemaParseFailed {
                details: summarize(&diagnostics),
            })
        }
    }

    /// Validate the file at `file_path` against `schema`.
    ///
    /// Safe to call concurrently; each call uses its own validation context.
    pub fn validate_file(
        &self,
        schema: &XmlSchemaPtr,
        file_path: &Path,
    ) -> LibXml2Result<ValidationResult> {
        let path_str = file_path.to_str().ok_or_else(|| LibXml2Error::ValidationFailed {
            code: -1,
            file: file_path.to_path_buf(),
        })?;
        let c_path = CString::new(path_str).map_err(|_| LibXml2Error::ValidationFailed {
            code: -1,
            file: file_path.to_path_buf(),
        })?;

        let mut diagnostics: Vec<Diagnostic> = Vec::new();
        let result_code = unsafe {
            let valid_ctxt = xmlSchemaNewValidCtxt(schema.as_ptr());
            if valid_ctxt.is_null() {
                return Err(LibXml2Error::ValidationContextCreationFailed);
            }

            xmlSchemaSetValidStructuredErrors(
                valid_ctxt,
                Some(collect_diagnostic),
                &mut diagnostics as *mut Vec<Diagnostic> as *mut c_void,
            );
            let code = xmlSchemaValidateFile(valid_ctxt, c_path.as_ptr(), 0);
            xmlSchemaFreeValidCtxt(valid_ctxt);
            code
        };

        match ValidationResult::from_code(result_code, diagnostics) {
            ValidationResult::InternalError { code } => Err(LibXml2Error::ValidationFailed {
                code,
                file: file_path.to_path_buf(),
            }),
            result => Ok(result),
        }
    }
}

impl Default for LibXml2Wrapper {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    let messages: Vec<&str> = diagnostics
        .iter()
        .filter(|d| d.level >= DiagnosticLevel::Error)
        .map(|d| d.message.as_str())
        .collect();
    if messages.is_empty() {
        "schema could not be compiled".to_string()
    } else {
        messages.join("; ")
    }
}
