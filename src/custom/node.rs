//! Hosting for npm-module custom providers.
//!
//! A Rust binary cannot import a JS module in-process, so the module is
//! run by `node -e <shim>`: the shim imports the resolved module (a
//! provider object or a factory taking `{id, config, sourceOptions}`) and
//! serves the same stdin/stdout envelope protocol as script providers.

use std::path::{Path, PathBuf};

use crate::custom::ipc::Invocation;

/// JS host executed with `node --input-type=module -e`. Reads one request
/// envelope from stdin, dispatches it to the imported module, writes one
/// response envelope to stdout. Never throws past the outer catch.
const NODE_SHIM: &str = r#"
import { readFileSync } from 'node:fs';
import { pathToFileURL } from 'node:url';

const modulePath = process.argv[1];
const reply = (obj) => process.stdout.write(JSON.stringify(obj));

try {
  const req = JSON.parse(readFileSync(0, 'utf8'));
  const imported = await import(pathToFileURL(modulePath));
  let provider = imported.default ?? imported.provider ?? imported;
  if (typeof provider === 'function') {
    provider = await provider({
      id: req.providerId,
      config: req.providerConfig,
      sourceOptions: req.sourceOptions,
    });
  }
  if (req.operation === 'describe') {
    const d = typeof provider.describe === 'function' ? await provider.describe() : provider;
    reply({ ok: true, data: {
      id: d.id,
      displayName: d.displayName,
      tier: d.tier,
      envVar: d.envVar,
      requiresApiKey: d.requiresApiKey,
      capabilities: d.capabilities ?? {
        execute: typeof provider.execute === 'function',
        submit: typeof provider.submit === 'function',
        poll: typeof provider.poll === 'function',
        retrieve: typeof provider.retrieve === 'function',
        test: typeof provider.test === 'function',
      },
    }});
  } else {
    const fn = provider[req.operation];
    if (typeof fn !== 'function') {
      throw new Error(`operation not supported: ${req.operation}`);
    }
    const arg = req.operation === 'poll' || req.operation === 'retrieve' ? req.handle : req.query;
    const data = await fn.call(provider, arg, req.options ?? {});
    reply({ ok: true, data });
  }
} catch (err) {
  reply({ ok: false, error: String(err && err.message ? err.message : err) });
}
"#;

/// Resolve a module spec, project tree first, then the global tree next to
/// the running binary (the `npm -g` layout: `<prefix>/lib/node_modules`).
pub fn resolve_module(module: &str, project_dir: &Path) -> Option<PathBuf> {
    // Relative or absolute paths resolve against the project directly.
    if module.starts_with('.') || module.starts_with('/') {
        let candidate = project_dir.join(module);
        return candidate.exists().then_some(candidate);
    }

    let project_candidate = project_dir.join("node_modules").join(module);
    if project_candidate.exists() {
        return Some(project_candidate);
    }

    let exe_dir = std::env::current_exe().ok()?;
    let global_candidate = exe_dir
        .parent()?
        .parent()?
        .join("lib/node_modules")
        .join(module);
    global_candidate.exists().then_some(global_candidate)
}

/// Invocation that hosts the module behind the envelope protocol.
pub fn module_invocation(module_path: &Path) -> Invocation {
    Invocation {
        command: "node".to_string(),
        args: vec![
            "--input-type=module".to_string(),
            "-e".to_string(),
            NODE_SHIM.to_string(),
            module_path.to_string_lossy().into_owned(),
        ],
        env: Default::default(),
        cwd: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_modules_resolve_against_project() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("provider.mjs");
        std::fs::write(&module, "export default {}").unwrap();
        assert_eq!(
            resolve_module("./provider.mjs", dir.path()),
            Some(dir.path().join("./provider.mjs"))
        );
        assert!(resolve_module("./missing.mjs", dir.path()).is_none());
    }

    #[test]
    fn bare_modules_resolve_from_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("node_modules/my-provider");
        std::fs::create_dir_all(&pkg).unwrap();
        assert_eq!(resolve_module("my-provider", dir.path()), Some(pkg));
        assert!(resolve_module("not-installed", dir.path()).is_none());
    }

    #[test]
    fn module_invocation_carries_shim_and_path() {
        let invocation = module_invocation(Path::new("/p/node_modules/x"));
        assert_eq!(invocation.command, "node");
        assert_eq!(invocation.args[0], "--input-type=module");
        assert!(invocation.args[2].contains("pathToFileURL"));
        assert_eq!(invocation.args[3], "/p/node_modules/x");
    }
}
