use super::*;
use crate::prelude::*;
use std::{
  fs,
  io::Write as _,
  sync::Arc,
  time::{Duration, SystemTime},
};

const QUERY_PATH_INFO: &str = "select id, hash, registrationTime, deriver, narSize, ultimate, \
                               sigs, ca from ValidPaths where path = ?";

const QUERY_REFS: &str =
  "select path from Refs join ValidPaths on reference = id where referrer = ?";

const QUERY_REALISATION: &str =
  "select ValidPaths.path, Realisations.signatures from Realisations join ValidPaths on \
   outputPath = ValidPaths.id where drvPath = ? and outputName = ?";

pub struct LocalStore {
  root: PathBuf,
  store: PathBuf,
  settings: Arc<Settings>,
  db: Sqlite,
}

impl LocalStore {
  /// Open (creating if necessary) a store rooted at the user's data
  /// directory.
  pub fn new(settings: Arc<Settings>) -> Result<Self> {
    let d = dirs::data_dir().ok_or_else(|| anyhow!("no data dir set"))?;
    Self::open_at(d.join("silo"), settings)
  }

  pub fn open_at(root: PathBuf, settings: Arc<Settings>) -> Result<Self> {
    let storedir = root.join("store");
    let dbdir = root.join("db");

    fs::create_dir_all(&storedir)?;
    fs::create_dir_all(&dbdir)?;

    let db = Sqlite::open(dbdir.join("silo.sqlite"))?;

    db.lock().execute_batch(include_str!(concat!(
      env!("CARGO_MANIFEST_DIR"),
      "/schema.sql"
    )))?;

    Ok(Self {
      root,
      store: storedir,
      settings,
      db,
    })
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  fn fingerprint(&self, info: &ValidPathInfo) -> String {
    let refs = info
      .refs
      .iter()
      .map(|r| self.print_store_path(r))
      .collect::<Vec<_>>()
      .join(",");
    format!(
      "1;{};{};{};{}",
      self.print_store_path(&info.path),
      info.nar_hash.encode_with_type(Encoding::Base32),
      info.nar_size.unwrap_or(0),
      refs
    )
  }

  fn sign(&self, data: &str) -> Option<String> {
    let key = self.settings.secret_key.as_deref()?;
    let (name, secret) = break_str(key, ':')?;
    let tag = Hash::hash(format!("{}\n{}", secret, data), HashType::SHA256);
    Some(format!("{}:{}", name, tag.encode(Encoding::Base64)))
  }
}

impl Store for LocalStore {
  fn store_path(&self) -> &Path {
    &self.store
  }

  fn compute_fs_closure(&self, path: &StorePath, closure: &mut StorePathSet) -> Result<()> {
    if !closure.insert(path.clone()) {
      return Ok(());
    }
    let info = self.get_path_info(path)?;
    for r in &info.refs {
      if r != path {
        self.compute_fs_closure(r, closure)?;
      }
    }
    Ok(())
  }

  fn query_path_info(&self, path: &StorePath) -> Result<Option<ValidPathInfo>> {
    let db = self.db.lock();

    let mut stmt = db.prepare(QUERY_PATH_INFO)?;

    let mut iter = stmt.query_and_then::<_, anyhow::Error, _, _>(
      params![self.print_store_path(path)],
      |row| {
        let hash = Hash::decode(row.get::<_, String>("hash")?).with_context(|| {
          format!(
            "path-info entry for `{}' is invalid",
            self.print_store_path(path)
          )
        })?;

        let mut path_info = ValidPathInfo::new(path.clone(), hash);

        path_info.id = row.get::<_, i64>("id")?;
        path_info.registration_time = Some(
          SystemTime::UNIX_EPOCH
            + Duration::from_secs(row.get::<_, i64>("registrationTime")? as u64),
        );

        let deriver_path = row.get::<_, Option<String>>("deriver")?.unwrap_or_default();
        if !deriver_path.is_empty() {
          path_info.deriver = Some(self.parse_store_path(Path::new(&deriver_path))?);
        }

        path_info.nar_size = Some(row.get::<_, i64>("narSize")? as _);
        path_info.ultimate = row.get::<_, Option<bool>>("ultimate")?.unwrap_or(false);
        path_info.sigs = row
          .get::<_, Option<String>>("sigs")?
          .unwrap_or_default()
          .split_ascii_whitespace()
          .map(|x| x.to_string())
          .collect();
        let ca = row.get::<_, Option<String>>("ca")?.unwrap_or_default();
        if !ca.is_empty() {
          path_info.ca = Some(ca);
        }

        Ok(path_info)
      },
    )?;

    if let Some(mut info) = iter.next().transpose()? {
      drop(iter);
      drop(stmt);
      let mut stmt = db.prepare(QUERY_REFS)?;

      for ref_ in stmt.query_and_then(params![info.id], |row| row.get::<_, String>("path"))? {
        info.refs.insert(self.parse_store_path(Path::new(&ref_?))?);
      }

      Ok(Some(info))
    } else {
      Ok(None)
    }
  }

  fn register_valid_paths(&self, infos: Vec<ValidPathInfo>) -> Result<()> {
    const REGISTER_VALID: &str = "insert into ValidPaths (path, hash, registrationTime, deriver, \
                                  narSize, ultimate, sigs, ca) values (?, ?, ?, ?, ?, ?, ?, ?)";
    const UPDATE_VALID: &str =
      "update ValidPaths set narSize = ?, hash = ?, ultimate = ?, sigs = ?, ca = ? where id = ?";

    let mut db = self.db.lock();
    let tx = db.transaction()?;

    for info in &infos {
      let path = self.print_store_path(&info.path);
      let sigs = info.sigs.iter().cloned().collect::<Vec<_>>().join(" ");

      if let Some(current_id) = tx
        .query_row::<i64, _, _>(
          "select id from ValidPaths where path = ?",
          params![&path],
          |r| r.get("id"),
        )
        .optional()?
      {
        tx.execute(
          UPDATE_VALID,
          params![
            info.nar_size.unwrap_or_default() as i64,
            info.nar_hash.encode_with_type(Encoding::Base16),
            info.ultimate,
            sigs,
            info.ca.clone().unwrap_or_default(),
            current_id
          ],
        )?;
      } else {
        tx.execute(
          REGISTER_VALID,
          params![
            path,
            info.nar_hash.encode_with_type(Encoding::Base16),
            info.registration_time_sql(),
            info
              .deriver
              .as_ref()
              .map_or_else(String::new, |d| self.print_store_path(d)),
            info.nar_size.unwrap_or_default() as i64,
            info.ultimate,
            sigs,
            info.ca.clone().unwrap_or_default(),
          ],
        )?;
      }
    }

    // reference rows go in after every referenced path has an id
    for info in &infos {
      let referrer: i64 = tx.query_row(
        "select id from ValidPaths where path = ?",
        params![self.print_store_path(&info.path)],
        |r| r.get("id"),
      )?;
      for r in &info.refs {
        let reference: i64 = tx
          .query_row(
            "select id from ValidPaths where path = ?",
            params![self.print_store_path(r)],
            |row| row.get("id"),
          )
          .with_context(|| {
            format!(
              "cannot register reference to unknown path `{}'",
              self.print_store_path(r)
            )
          })?;
        tx.execute(
          "insert or ignore into Refs (referrer, reference) values (?, ?)",
          params![referrer, reference],
        )?;
      }
    }

    tx.commit()?;
    Ok(())
  }

  fn register_realisation(&self, realisation: &Realisation) -> Result<()> {
    let db = self.db.lock();
    let output_path: i64 = db.query_row(
      "select id from ValidPaths where path = ?",
      params![self.print_store_path(&realisation.out_path)],
      |r| r.get("id"),
    )?;
    db.execute(
      "insert into Realisations (drvPath, outputName, outputPath, signatures) values (?, ?, ?, ?)",
      params![
        realisation.id.drv_hash.encode_with_type(Encoding::Base16),
        realisation.id.output_name,
        output_path,
        realisation
          .signatures
          .iter()
          .cloned()
          .collect::<Vec<_>>()
          .join(" ")
      ],
    )?;
    Ok(())
  }

  fn query_realisation(&self, id: &DrvOutput) -> Result<Option<Realisation>> {
    let db = self.db.lock();
    let mut stmt = db.prepare(QUERY_REALISATION)?;
    let mut rows = stmt.query_and_then::<_, anyhow::Error, _, _>(
      params![
        id.drv_hash.encode_with_type(Encoding::Base16),
        id.output_name
      ],
      |row| {
        Ok(Realisation {
          id: id.clone(),
          out_path: self.parse_store_path(Path::new(&row.get::<_, String>(0)?))?,
          signatures: row
            .get::<_, Option<String>>(1)?
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(|x| x.to_string())
            .collect(),
        })
      },
    )?;
    rows.next().transpose()
  }

  fn sign_path_info(&self, info: &mut ValidPathInfo) -> Result<()> {
    if let Some(sig) = self.sign(&self.fingerprint(info)) {
      info.sigs.insert(sig);
    }
    Ok(())
  }

  fn sign_realisation(&self, realisation: &mut Realisation) -> Result<()> {
    let data = format!(
      "1;{};{}",
      realisation.id,
      self.print_store_path(&realisation.out_path)
    );
    if let Some(sig) = self.sign(&data) {
      realisation.signatures.insert(sig);
    }
    Ok(())
  }

  fn add_temp_root(&self, path: &StorePath) -> Result<()> {
    let dir = self.root.join("temproots");
    fs::create_dir_all(&dir)?;
    let mut f = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(dir.join(std::process::id().to_string()))?;
    writeln!(f, "{}", self.print_store_path(path))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_store() -> (tempfile::TempDir, LocalStore) {
    let _ = logger::init(None);
    let dir = tempfile::tempdir().unwrap();
    let store =
      LocalStore::open_at(dir.path().join("silo"), Arc::new(Settings::default())).unwrap();
    (dir, store)
  }

  fn dummy_info(store: &LocalStore, name: &str, contents: &str) -> ValidPathInfo {
    let path = store
      .make_store_path("text", Hash::hash(contents, HashType::SHA256), name)
      .unwrap();
    ValidPathInfo::new(path, Hash::hash(contents, HashType::SHA256))
  }

  #[test]
  fn registration_roundtrip() {
    let (_d, store) = test_store();
    let mut info = dummy_info(&store, "foo", "hello");
    info.nar_size = Some(5);
    info.ultimate = true;
    let path = info.path.clone();

    store.register_valid_paths(vec![info]).unwrap();

    let back = store.get_path_info(&path).unwrap();
    assert_eq!(back.path, path);
    assert_eq!(back.nar_size, Some(5));
    assert!(back.ultimate);
    assert!(store.is_valid_path(&path).unwrap());
  }

  #[test]
  fn closure_follows_references() {
    let (_d, store) = test_store();
    let dep = dummy_info(&store, "dep", "dep");
    let mut top = dummy_info(&store, "top", "top");
    top.refs.insert(dep.path.clone());
    let top_path = top.path.clone();
    let dep_path = dep.path.clone();

    store.register_valid_paths(vec![dep, top]).unwrap();

    let mut closure = StorePathSet::new();
    store.compute_fs_closure(&top_path, &mut closure).unwrap();
    assert!(closure.contains(&top_path));
    assert!(closure.contains(&dep_path));
  }

  #[test]
  fn registering_a_reference_to_an_unknown_path_fails() {
    let (_d, store) = test_store();
    let ghost = dummy_info(&store, "ghost", "ghost");
    let mut top = dummy_info(&store, "top", "top");
    top.refs.insert(ghost.path.clone());

    assert!(store.register_valid_paths(vec![top]).is_err());
  }

  #[test]
  fn realisations_roundtrip() {
    let (_d, store) = test_store();
    let info = dummy_info(&store, "out", "out");
    let out_path = info.path.clone();
    store.register_valid_paths(vec![info]).unwrap();

    let id = DrvOutput {
      drv_hash: Hash::hash("drv", HashType::SHA256),
      output_name: "out".into(),
    };
    let r = Realisation {
      id: id.clone(),
      out_path: out_path.clone(),
      signatures: Default::default(),
    };
    store.register_realisation(&r).unwrap();

    let back = store.query_realisation(&id).unwrap().unwrap();
    assert_eq!(back.out_path, out_path);
  }

  #[test]
  fn signing_requires_a_key() {
    let (_d, store) = test_store();
    let mut info = dummy_info(&store, "x", "x");
    store.sign_path_info(&mut info).unwrap();
    assert!(info.sigs.is_empty());

    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
      secret_key: Some("cache.example.org-1:deadbeef".into()),
      ..Default::default()
    };
    let store2 = LocalStore::open_at(dir.path().join("silo"), Arc::new(settings)).unwrap();
    let mut info2 = ValidPathInfo::new(info.path.clone(), info.nar_hash);
    store2.sign_path_info(&mut info2).unwrap();
    assert_eq!(info2.sigs.len(), 1);
    assert!(info2.sigs.iter().next().unwrap().starts_with("cache.example.org-1:"));
  }
}
