//! Runtime patcher for loader source text.
//!
//! The stock loader assumes static hosting: it reads a global `document`,
//! derives its script directory from a `blob:` URL, imports sibling modules
//! with native `import(...)`, locates the WASM binary relative to
//! `import.meta.url` and reads files through a native primitive. The rules
//! here rewrite those spots so every one of them goes through the fetch
//! interceptor instead.
//!
//! Rules are plain substring replacements applied in table order. Later
//! rules may rely on text produced by earlier ones, so the order is part of
//! the table. Applying a table twice is not safe: rules whose replacement
//! still contains their own pattern fire again.

use crate::error::ProxyError;

/// A module containing this marker is left untouched.
pub const OPT_OUT_MARKER: &str = "// SKIP";

/// Global the patched source calls instead of `import(...)`.
pub const IMPORT_HOOK: &str = "customImport";

/// Global the patched source calls instead of reading `document`.
pub const DOCUMENT_ACCESSOR: &str = "getDocument";

const NATIVE_IMPORT: &str = "await import(";
const HOOKED_IMPORT: &str = "await globalThis.customImport(";

/// Where the opt-out marker is honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptOutScope {
    /// The marker gates the rule set for the module being patched only;
    /// modules pulled in later through the import hook are always rewritten.
    WholeModule,
    /// The marker is re-checked for every module, including each one loaded
    /// through the import hook.
    PerImport,
}

/// One ordered rewrite. Alternatives are applied in sequence.
#[derive(Debug, Clone)]
pub struct PatchRule {
    pub name: &'static str,
    pub replacements: Vec<(String, String)>,
    /// Bootstrap source must contain at least one of the patterns.
    pub required: bool,
}

impl PatchRule {
    fn new(name: &'static str, required: bool, replacements: Vec<(String, String)>) -> Self {
        Self {
            name,
            replacements,
            required,
        }
    }

    /// Apply every alternative, returning the number of substitutions.
    pub fn apply(&self, text: &mut String) -> usize {
        let mut hits = 0;
        for (pattern, replacement) in &self.replacements {
            let count = text.matches(pattern.as_str()).count();
            if count > 0 {
                *text = text.replace(pattern.as_str(), replacement);
                hits += count;
            }
        }
        hits
    }
}

/// Ordered rule set for one loader release.
#[derive(Debug, Clone)]
pub struct PatchTable {
    pub version: &'static str,
    /// Substrings that identify sources this table was written against.
    /// An empty list matches any source.
    pub signatures: Vec<&'static str>,
    pub rules: Vec<PatchRule>,
}

impl PatchTable {
    /// Rules for the .NET 8 `dotnet.js` loader family.
    pub fn dotnet8(base_path: &str) -> Self {
        let pair = |from: &str, to: String| (from.to_string(), to);
        let document = format!("globalThis.{DOCUMENT_ACCESSOR}()");
        Self {
            version: "dotnet-8",
            signatures: Vec::new(),
            rules: vec![
                PatchRule::new(
                    "document-accessor",
                    false,
                    vec![pair("globalThis.document", document.clone())],
                ),
                PatchRule::new(
                    "script-directory",
                    false,
                    vec![pair(
                        "qe.locateFile=",
                        format!(
                            "qe.scriptDirectory=qe.scriptDirectory.replace('blob:',''),qe.scriptDirectory+='{base_path}',qe.locateFile="
                        ),
                    )],
                ),
                PatchRule::new(
                    "import-hook",
                    true,
                    vec![
                        pair("=import(", format!("=globalThis.{IMPORT_HOOK}(")),
                        pair(NATIVE_IMPORT, HOOKED_IMPORT.to_string()),
                    ],
                ),
                PatchRule::new(
                    "wasm-location",
                    false,
                    vec![
                        pair(
                            "new URL(\"dotnet.native.wasm\",import.meta.url)",
                            format!("new URL(\"dotnet.native.wasm\",{document}.location.origin+'/{base_path}')"),
                        ),
                        pair(
                            "_scriptDir = import.meta.url",
                            format!("_scriptDir = {document}.location.origin+\"/{base_path}\""),
                        ),
                    ],
                ),
                PatchRule::new(
                    "read-async-shim",
                    false,
                    vec![pair(
                        "DOTNET.setup",
                        "readAsync = (filename, onload, onerror, binary = true) => globalThis.fetch(new URL(filename)).then(response => response.ok ? (binary ? response.arrayBuffer() : response.text()).then(onload) : Promise.reject(response.statusText)).catch(onerror);DOTNET.setup".to_string(),
                    )],
                ),
            ],
        }
    }

    fn matches(&self, source: &str) -> bool {
        self.signatures.iter().all(|s| source.contains(s))
    }
}

/// What a single application did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub text: String,
    pub version: &'static str,
    pub opted_out: bool,
    /// Substitution count per rule, in table order.
    pub hits: Vec<(&'static str, usize)>,
}

impl PatchOutcome {
    /// Required rules that found nothing to rewrite.
    pub fn missing_required<'a>(&'a self, table: &'a PatchTable) -> impl Iterator<Item = &'static str> + 'a {
        table
            .rules
            .iter()
            .zip(&self.hits)
            .filter(|(rule, (_, count))| rule.required && *count == 0)
            .map(|(rule, _)| rule.name)
    }
}

#[derive(Debug, Clone)]
pub struct Patcher {
    tables: Vec<PatchTable>,
    scope: OptOutScope,
}

impl Default for Patcher {
    fn default() -> Self {
        Self::new(vec![PatchTable::dotnet8("_framework/")], OptOutScope::WholeModule)
    }
}

impl Patcher {
    /// Tables are tried in order; the first whose signatures all match wins,
    /// and the last one is the fallback.
    pub fn new(tables: Vec<PatchTable>, scope: OptOutScope) -> Self {
        Self { tables, scope }
    }

    pub fn for_base_path(base_path: &str, scope: OptOutScope) -> Self {
        Self::new(vec![PatchTable::dotnet8(base_path)], scope)
    }

    pub fn scope(&self) -> OptOutScope {
        self.scope
    }

    /// Pick the table for `source`.
    pub fn table_for(&self, source: &str) -> Option<&PatchTable> {
        self.tables
            .iter()
            .find(|t| t.matches(source))
            .or_else(|| self.tables.last())
    }

    /// Apply the selected table to `source`, honouring the opt-out marker.
    pub fn apply(&self, source: &str) -> PatchOutcome {
        let Some(table) = self.table_for(source) else {
            return PatchOutcome {
                text: source.to_string(),
                version: "none",
                opted_out: false,
                hits: Vec::new(),
            };
        };

        if source.contains(OPT_OUT_MARKER) {
            return PatchOutcome {
                text: source.to_string(),
                version: table.version,
                opted_out: true,
                hits: table.rules.iter().map(|r| (r.name, 0)).collect(),
            };
        }

        let mut text = source.to_string();
        let hits = table
            .rules
            .iter()
            .map(|rule| (rule.name, rule.apply(&mut text)))
            .collect();

        PatchOutcome {
            text,
            version: table.version,
            opted_out: false,
            hits,
        }
    }

    /// Patch the bootstrap module. A required rule that matches nothing means
    /// the loader release is not one the tables were written for.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::PatchMismatch`] naming the first missed rule.
    pub fn patch_strict(&self, source: &str) -> Result<String, ProxyError> {
        let outcome = self.apply(source);
        if !outcome.opted_out {
            if let Some(table) = self.table_for(source) {
                if let Some(rule) = outcome.missing_required(table).next() {
                    tracing::error!("Bootstrap source did not match rule {rule} of {}", table.version);
                    return Err(ProxyError::PatchMismatch {
                        table: table.version.to_string(),
                        rule: rule.to_string(),
                    });
                }
            }
        }
        tracing::debug!("Patched bootstrap with {}: {:?}", outcome.version, outcome.hits);
        Ok(outcome.text)
    }

    /// Patch any other script. Misses are logged, never fatal.
    pub fn patch_lenient(&self, source: &str) -> String {
        let outcome = self.apply(source);
        if !outcome.opted_out {
            if let Some(table) = self.table_for(source) {
                for rule in outcome.missing_required(table) {
                    tracing::debug!("Rule {rule} of {} found no match", table.version);
                }
            }
        }
        outcome.text
    }

    /// Rewrite for a module loaded through the import hook.
    pub fn rewrite_nested_imports(&self, source: &str) -> String {
        if self.scope == OptOutScope::PerImport && source.contains(OPT_OUT_MARKER) {
            return source.to_string();
        }
        source.replace(NATIVE_IMPORT, HOOKED_IMPORT)
    }
}
