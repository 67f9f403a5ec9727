//! SQL execution for the broker protocol.
//!
//! One transaction per [`DbOp`]: commit on success, roll back on any error.
//! Connections are owned by the caller (one per database worker); nothing
//! here pools or retries.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::{Connection, PgConnection, Postgres, Row, Transaction};
use wheelhouse_model::{
    BuildAttempt, BuildArtifact, BuildId, BuildStatus, DependencyTool,
    DownloadRecord, MasterStats, Package, PackageDependency, PackageName,
    PackageVersion, PendingBuild, SkipReason, VersionString,
};

use super::{
    BuildRecord, DbError, DbOp, DbReply, DeletedBuild, IndexPackage,
    PackageFile, ProjectFile,
};

type Tx<'c> = Transaction<'c, Postgres>;
type Result<T> = std::result::Result<T, DbError>;

/// Runs one operation inside a transaction on the given connection.
pub async fn execute(conn: &mut PgConnection, op: &DbOp) -> Result<DbReply> {
    let mut tx = conn.begin().await.map_err(DbError::classify)?;
    match run_op(&mut tx, op).await {
        Ok(reply) => {
            tx.commit().await.map_err(DbError::classify)?;
            Ok(reply)
        }
        Err(err) => {
            // Rollback failure is subsumed by the original error.
            let _ = tx.rollback().await;
            tracing::debug!(?op, %err, "operation rolled back");
            Err(err)
        }
    }
}

async fn run_op(tx: &mut Tx<'_>, op: &DbOp) -> Result<DbReply> {
    match op {
        DbOp::AddNewPackage { package, skip } => {
            let result = sqlx::query(
                r#"
                INSERT INTO packages (package, skip)
                VALUES ($1, $2)
                ON CONFLICT (package) DO NOTHING
                "#,
            )
            .bind(package.as_str())
            .bind(skip.as_str())
            .execute(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            Ok(DbReply::Created(result.rows_affected() > 0))
        }

        DbOp::AddNewPackageVersion {
            package,
            version,
            released_at,
            skip,
        } => {
            let result = sqlx::query(
                r#"
                INSERT INTO versions (package, version, released, skip)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (package, version) DO NOTHING
                "#,
            )
            .bind(package.as_str())
            .bind(version.as_str())
            .bind(released_at)
            .bind(skip.as_str())
            .execute(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            Ok(DbReply::Created(result.rows_affected() > 0))
        }

        DbOp::SkipPackage { package, reason } => {
            set_package_skip(tx, package, reason.as_str()).await
        }
        DbOp::UnskipPackage { package } => {
            set_package_skip(tx, package, "").await
        }
        DbOp::SkipPackageVersion {
            package,
            version,
            reason,
        } => set_version_skip(tx, package, version, reason.as_str()).await,
        DbOp::UnskipPackageVersion { package, version } => {
            set_version_skip(tx, package, version, "").await
        }

        DbOp::GetAllPackages => {
            let rows = sqlx::query(
                "SELECT package, skip FROM packages ORDER BY package",
            )
            .fetch_all(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            let packages = rows
                .into_iter()
                .map(|row| {
                    Ok(Package {
                        name: package_name(row.try_get("package")?)?,
                        skip: SkipReason::from(
                            row.try_get::<String, _>("skip")?,
                        ),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(DbReply::Packages(packages))
        }

        DbOp::GetPackageVersions { package } => {
            let rows = sqlx::query(
                r#"
                SELECT version, released, skip
                FROM versions
                WHERE package = $1
                ORDER BY released ASC, version ASC
                "#,
            )
            .bind(package.as_str())
            .fetch_all(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            let versions = rows
                .into_iter()
                .map(|row| {
                    Ok(PackageVersion {
                        package: package.clone(),
                        version: VersionString(row.try_get("version")?),
                        released_at: row.try_get("released")?,
                        skip: SkipReason::from(
                            row.try_get::<String, _>("skip")?,
                        ),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(DbReply::Versions(versions))
        }

        DbOp::GetPendingBuilds { abi, limit } => {
            let rows = sqlx::query(
                r#"
                SELECT v.package, v.version
                FROM versions v
                JOIN packages p ON p.package = v.package
                WHERE p.skip = ''
                  AND v.skip = ''
                  AND NOT EXISTS (
                    SELECT 1
                    FROM files f
                    JOIN builds b ON b.build_id = f.build_id
                    WHERE b.package = v.package
                      AND b.version = v.version
                      AND (f.abi_tag = $1 OR f.abi_tag = 'none')
                  )
                ORDER BY v.released ASC, v.package ASC
                LIMIT $2
                "#,
            )
            .bind(abi.as_str())
            .bind(limit)
            .fetch_all(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            let pending = rows
                .into_iter()
                .map(|row| {
                    Ok(PendingBuild {
                        package: package_name(row.try_get("package")?)?,
                        version: VersionString(row.try_get("version")?),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(DbReply::PendingBuilds(pending))
        }

        DbOp::LogBuild { attempt, files } => {
            log_build(tx, attempt, files).await
        }

        DbOp::GetPackageFiles { package } => {
            let rows = sqlx::query(
                r#"
                SELECT f.filename, f.filesize, f.filehash
                FROM files f
                JOIN builds b ON b.build_id = f.build_id
                WHERE b.package = $1
                ORDER BY f.filename ASC
                "#,
            )
            .bind(package.as_str())
            .fetch_all(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            let files = rows
                .into_iter()
                .map(|row| {
                    Ok(PackageFile {
                        filename: row.try_get("filename")?,
                        filesize: row.try_get("filesize")?,
                        filehash: row.try_get("filehash")?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(DbReply::PackageFiles(files))
        }

        DbOp::GetProjectFiles { package } => {
            get_project_files(tx, package).await
        }

        DbOp::GetIndexPackages => {
            let rows = sqlx::query(
                r#"
                SELECT b.package, COUNT(f.filename) AS wheels
                FROM files f
                JOIN builds b ON b.build_id = f.build_id
                JOIN packages p ON p.package = b.package
                WHERE p.skip = ''
                GROUP BY b.package
                ORDER BY b.package ASC
                "#,
            )
            .fetch_all(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            let packages = rows
                .into_iter()
                .map(|row| {
                    Ok(IndexPackage {
                        name: package_name(row.try_get("package")?)?,
                        wheels: row.try_get("wheels")?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(DbReply::IndexPackages(packages))
        }

        DbOp::GetStatistics => get_statistics(tx).await,

        DbOp::LogDownloads { records } => {
            for record in records {
                log_download(tx, record).await?;
            }
            Ok(DbReply::Done)
        }

        DbOp::GetBuild { build_id } => get_build(tx, *build_id).await,

        DbOp::DeleteBuild { build_id } => {
            delete_build(tx, *build_id).await
        }

        DbOp::VersionSkipped { package, version } => {
            let row = sqlx::query(
                r#"
                SELECT (p.skip <> '' OR v.skip <> '') AS skipped
                FROM packages p
                JOIN versions v ON v.package = p.package
                WHERE p.package = $1 AND v.version = $2
                "#,
            )
            .bind(package.as_str())
            .bind(version.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            // A vanished version row must never be recorded against.
            let skipped = match row {
                Some(row) => row.try_get("skipped")?,
                None => true,
            };
            Ok(DbReply::Skipped(skipped))
        }

        DbOp::GetVersionBuildIds { package, version } => {
            let rows = sqlx::query(
                r#"
                SELECT DISTINCT b.build_id
                FROM builds b
                JOIN files f ON f.build_id = b.build_id
                WHERE b.package = $1 AND b.version = $2
                ORDER BY b.build_id ASC
                "#,
            )
            .bind(package.as_str())
            .bind(version.as_str())
            .fetch_all(&mut **tx)
            .await
            .map_err(DbError::classify)?;
            let ids = rows
                .into_iter()
                .map(|row| Ok(BuildId(row.try_get("build_id")?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(DbReply::BuildIds(ids))
        }
    }
}

async fn set_package_skip(
    tx: &mut Tx<'_>,
    package: &PackageName,
    reason: &str,
) -> Result<DbReply> {
    sqlx::query("UPDATE packages SET skip = $2 WHERE package = $1")
        .bind(package.as_str())
        .bind(reason)
        .execute(&mut **tx)
        .await
        .map_err(DbError::classify)?;
    Ok(DbReply::Done)
}

async fn set_version_skip(
    tx: &mut Tx<'_>,
    package: &PackageName,
    version: &VersionString,
    reason: &str,
) -> Result<DbReply> {
    sqlx::query(
        "UPDATE versions SET skip = $3 WHERE package = $1 AND version = $2",
    )
    .bind(package.as_str())
    .bind(version.as_str())
    .bind(reason)
    .execute(&mut **tx)
    .await
    .map_err(DbError::classify)?;
    Ok(DbReply::Done)
}

async fn log_build(
    tx: &mut Tx<'_>,
    attempt: &BuildAttempt,
    files: &[BuildArtifact],
) -> Result<DbReply> {
    if !files.is_empty() && !attempt.status.is_success() {
        return Err(DbError::Integrity(
            "build files may only be recorded against a successful attempt"
                .to_string(),
        ));
    }

    let row = sqlx::query(
        r#"
        INSERT INTO builds
            (package, version, abi_tag, built_by, duration_ms, status,
             started_at, output)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING build_id
        "#,
    )
    .bind(attempt.package.as_str())
    .bind(attempt.version.as_str())
    .bind(attempt.abi_tag.as_str())
    .bind(&attempt.built_by)
    .bind(attempt.duration.as_millis() as i64)
    .bind(attempt.status.as_bool())
    .bind(attempt.started_at)
    .bind(&attempt.output)
    .fetch_one(&mut **tx)
    .await
    .map_err(DbError::classify)?;
    let build_id = BuildId(row.try_get("build_id")?);

    for file in files {
        sqlx::query(
            r#"
            INSERT INTO files
                (filename, build_id, filesize, filehash, package_tag,
                 package_version_tag, py_version_tag, abi_tag, platform_tag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (filename) DO UPDATE SET
                build_id = EXCLUDED.build_id,
                filesize = EXCLUDED.filesize,
                filehash = EXCLUDED.filehash,
                package_tag = EXCLUDED.package_tag,
                package_version_tag = EXCLUDED.package_version_tag,
                py_version_tag = EXCLUDED.py_version_tag,
                abi_tag = EXCLUDED.abi_tag,
                platform_tag = EXCLUDED.platform_tag
            "#,
        )
        .bind(&file.filename)
        .bind(build_id.as_i64())
        .bind(file.filesize as i64)
        .bind(&file.filehash)
        .bind(&file.package_tag)
        .bind(&file.package_version_tag)
        .bind(file.py_version_tag.as_str())
        .bind(file.abi_tag.as_str())
        .bind(file.platform_tag.as_str())
        .execute(&mut **tx)
        .await
        .map_err(DbError::classify)?;

        // Re-recorded files replace their dependency set wholesale.
        sqlx::query("DELETE FROM dependencies WHERE filename = $1")
            .bind(&file.filename)
            .execute(&mut **tx)
            .await
            .map_err(DbError::classify)?;
        for dep in &file.dependencies {
            sqlx::query(
                r#"
                INSERT INTO dependencies (filename, tool, dependency)
                VALUES ($1, $2, $3)
                ON CONFLICT (filename, tool, dependency) DO NOTHING
                "#,
            )
            .bind(&file.filename)
            .bind(dep.tool.as_str())
            .bind(&dep.name)
            .execute(&mut **tx)
            .await
            .map_err(DbError::classify)?;
        }
    }

    Ok(DbReply::BuildLogged(build_id))
}

async fn get_project_files(
    tx: &mut Tx<'_>,
    package: &PackageName,
) -> Result<DbReply> {
    let rows = sqlx::query(
        r#"
        SELECT v.version, v.skip, v.released, f.filename, f.filesize,
               f.abi_tag, f.platform_tag, f.py_version_tag
        FROM files f
        JOIN builds b ON b.build_id = f.build_id
        JOIN versions v ON v.package = b.package AND v.version = b.version
        WHERE b.package = $1
        ORDER BY v.released DESC, f.filename ASC
        "#,
    )
    .bind(package.as_str())
    .fetch_all(&mut **tx)
    .await
    .map_err(DbError::classify)?;

    let dep_rows = sqlx::query(
        r#"
        SELECT d.filename, d.tool, d.dependency
        FROM dependencies d
        JOIN files f ON f.filename = d.filename
        JOIN builds b ON b.build_id = f.build_id
        WHERE b.package = $1
        ORDER BY d.tool ASC, d.dependency ASC
        "#,
    )
    .bind(package.as_str())
    .fetch_all(&mut **tx)
    .await
    .map_err(DbError::classify)?;

    let mut deps_by_file: HashMap<String, Vec<PackageDependency>> =
        HashMap::new();
    for row in dep_rows {
        let filename: String = row.try_get("filename")?;
        let tool: String = row.try_get("tool")?;
        let tool = DependencyTool::parse(&tool)
            .map_err(|e| DbError::Other(e.to_string()))?;
        deps_by_file.entry(filename).or_default().push(
            PackageDependency {
                tool,
                name: row.try_get("dependency")?,
            },
        );
    }

    let files = rows
        .into_iter()
        .map(|row| {
            let filename: String = row.try_get("filename")?;
            let dependencies =
                deps_by_file.remove(&filename).unwrap_or_default();
            Ok(ProjectFile {
                version: VersionString(row.try_get("version")?),
                version_skip: SkipReason::from(
                    row.try_get::<String, _>("skip")?,
                ),
                released_at: row.try_get("released")?,
                filesize: row.try_get("filesize")?,
                abi_tag: wheelhouse_model::AbiTag(row.try_get("abi_tag")?),
                platform_tag: row.try_get("platform_tag")?,
                py_version_tag: row.try_get("py_version_tag")?,
                filename,
                dependencies,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(DbReply::ProjectFiles(files))
}

async fn get_statistics(tx: &mut Tx<'_>) -> Result<DbReply> {
    let packages = sqlx::query("SELECT COUNT(*) AS n FROM packages")
        .fetch_one(&mut **tx)
        .await
        .map_err(DbError::classify)?;

    let versions = sqlx::query(
        r#"
        SELECT COUNT(*) AS total,
               COUNT(*) FILTER (WHERE skip <> '') AS skipped
        FROM versions
        "#,
    )
    .fetch_one(&mut **tx)
    .await
    .map_err(DbError::classify)?;

    let builds = sqlx::query(
        r#"
        SELECT COUNT(*) AS total,
               COUNT(*) FILTER
                   (WHERE started_at > now() - INTERVAL '1 hour')
                   AS last_hour
        FROM builds
        "#,
    )
    .fetch_one(&mut **tx)
    .await
    .map_err(DbError::classify)?;

    let pending = sqlx::query(
        r#"
        SELECT COUNT(*) AS n
        FROM versions v
        JOIN packages p ON p.package = v.package
        WHERE p.skip = ''
          AND v.skip = ''
          AND NOT EXISTS (
            SELECT 1 FROM files f WHERE f.build_id IN (
                SELECT b.build_id FROM builds b
                WHERE b.package = v.package AND b.version = v.version
            )
          )
        "#,
    )
    .fetch_one(&mut **tx)
    .await
    .map_err(DbError::classify)?;

    let files = sqlx::query("SELECT COUNT(*) AS n FROM files")
        .fetch_one(&mut **tx)
        .await
        .map_err(DbError::classify)?;

    let downloads = sqlx::query(
        r#"
        SELECT COUNT(*) AS total,
               COUNT(*) FILTER
                   (WHERE accessed_at > now() - INTERVAL '30 days')
                   AS last_month
        FROM downloads
        "#,
    )
    .fetch_one(&mut **tx)
    .await
    .map_err(DbError::classify)?;

    Ok(DbReply::Statistics(MasterStats {
        packages_tracked: packages.try_get("n")?,
        versions_tracked: versions.try_get("total")?,
        versions_skipped: versions.try_get("skipped")?,
        builds_total: builds.try_get("total")?,
        builds_last_hour: builds.try_get("last_hour")?,
        builds_pending: pending.try_get("n")?,
        files_count: files.try_get("n")?,
        downloads_total: downloads.try_get("total")?,
        downloads_last_month: downloads.try_get("last_month")?,
    }))
}

async fn log_download(
    tx: &mut Tx<'_>,
    record: &DownloadRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO downloads
            (filename, accessed_by, accessed_at, arch, distro_name,
             distro_version, os_name, os_version, py_name, py_version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&record.filename)
    .bind(&record.host)
    .bind(record.timestamp)
    .bind(&record.arch)
    .bind(&record.distro_name)
    .bind(&record.distro_version)
    .bind(&record.os_name)
    .bind(&record.os_version)
    .bind(&record.py_name)
    .bind(&record.py_version)
    .execute(&mut **tx)
    .await
    .map_err(DbError::classify)?;
    Ok(())
}

async fn get_build(tx: &mut Tx<'_>, build_id: BuildId) -> Result<DbReply> {
    let row = sqlx::query(
        r#"
        SELECT build_id, package, version, abi_tag, built_by, duration_ms,
               status, started_at, output
        FROM builds
        WHERE build_id = $1
        "#,
    )
    .bind(build_id.as_i64())
    .fetch_optional(&mut **tx)
    .await
    .map_err(DbError::classify)?;

    let Some(row) = row else {
        return Ok(DbReply::Build(None));
    };

    let attempt = decode_attempt(&row)?;
    let filenames = sqlx::query(
        "SELECT filename FROM files WHERE build_id = $1 ORDER BY filename",
    )
    .bind(build_id.as_i64())
    .fetch_all(&mut **tx)
    .await
    .map_err(DbError::classify)?
    .into_iter()
    .map(|row| Ok(row.try_get::<String, _>("filename")?))
    .collect::<Result<Vec<_>>>()?;

    Ok(DbReply::Build(Some(BuildRecord { attempt, filenames })))
}

async fn delete_build(
    tx: &mut Tx<'_>,
    build_id: BuildId,
) -> Result<DbReply> {
    let row = sqlx::query(
        "SELECT package, version FROM builds WHERE build_id = $1",
    )
    .bind(build_id.as_i64())
    .fetch_optional(&mut **tx)
    .await
    .map_err(DbError::classify)?;

    let Some(row) = row else {
        return Ok(DbReply::BuildDeleted(None));
    };
    let package = package_name(row.try_get("package")?)?;
    let version = VersionString(row.try_get("version")?);

    let filenames = sqlx::query(
        "SELECT filename FROM files WHERE build_id = $1 ORDER BY filename",
    )
    .bind(build_id.as_i64())
    .fetch_all(&mut **tx)
    .await
    .map_err(DbError::classify)?
    .into_iter()
    .map(|row| Ok(row.try_get::<String, _>("filename")?))
    .collect::<Result<Vec<_>>>()?;

    // Files and dependencies cascade.
    sqlx::query("DELETE FROM builds WHERE build_id = $1")
        .bind(build_id.as_i64())
        .execute(&mut **tx)
        .await
        .map_err(DbError::classify)?;

    Ok(DbReply::BuildDeleted(Some(DeletedBuild {
        package,
        version,
        filenames,
    })))
}

fn decode_attempt(row: &sqlx::postgres::PgRow) -> Result<BuildAttempt> {
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(BuildAttempt {
        build_id: Some(BuildId(row.try_get("build_id")?)),
        package: package_name(row.try_get("package")?)?,
        version: VersionString(row.try_get("version")?),
        abi_tag: wheelhouse_model::AbiTag(row.try_get("abi_tag")?),
        built_by: row.try_get("built_by")?,
        duration: Duration::from_millis(duration_ms.max(0) as u64),
        status: BuildStatus::from_bool(row.try_get("status")?),
        started_at: row.try_get("started_at")?,
        output: row.try_get("output")?,
    })
}

fn package_name(raw: String) -> Result<PackageName> {
    PackageName::new(&raw).map_err(|e| DbError::Other(e.to_string()))
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::classify(err)
    }
}
