use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Half-up rounding to one decimal: `floor(10x + 0.5) / 10`.
/// Applied at every level of the hierarchy (subject mean, unit, general,
/// cohort), so averages always consume already-rounded inputs.
pub fn round1(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitDef {
    pub id: String,
    pub name: String,
    pub coefficient: f64,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDef {
    pub id: String,
    pub unit_id: String,
    pub name: String,
    pub coefficient: f64,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct GradeRow {
    pub student_id: String,
    pub subject_id: String,
    pub value: f64,
}

fn matching_values(student_id: &str, subject_id: &str, grades: &[GradeRow]) -> Vec<f64> {
    grades
        .iter()
        .filter(|g| g.student_id == student_id && g.subject_id == subject_id)
        .map(|g| g.value)
        .collect()
}

/// Average for one (student, subject) pair. No recorded evaluation means
/// "not yet evaluated" and yields `None`, never zero. A single evaluation
/// passes through as entered; several evaluations (spreadsheet mode) are
/// arithmetic-meaned and rounded.
pub fn subject_average(student_id: &str, subject_id: &str, grades: &[GradeRow]) -> Option<f64> {
    let values = matching_values(student_id, subject_id, grades);
    match values.as_slice() {
        [] => None,
        [v] => Some(*v),
        vs => Some(round1(vs.iter().sum::<f64>() / vs.len() as f64)),
    }
}

fn subject_mean_unrounded(student_id: &str, subject_id: &str, grades: &[GradeRow]) -> Option<f64> {
    let values = matching_values(student_id, subject_id, grades);
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Coefficient-weighted mean of the unit's subject averages. Subjects
/// without an evaluation contribute to neither the numerator nor the
/// denominator.
pub fn unit_average(
    student_id: &str,
    unit_id: &str,
    subjects: &[SubjectDef],
    grades: &[GradeRow],
) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for s in subjects.iter().filter(|s| s.unit_id == unit_id) {
        let Some(avg) = subject_average(student_id, &s.id, grades) else {
            continue;
        };
        sum += avg * s.coefficient;
        denom += s.coefficient;
    }
    // denom fails to be positive when nothing contributed, or when the
    // caller broke the positive-coefficient invariant. Both yield None.
    if denom > 0.0 {
        Some(round1(sum / denom))
    } else {
        None
    }
}

/// Coefficient-weighted mean of the already-rounded unit averages. Units
/// with no evaluated subject are skipped entirely, not counted as zero.
pub fn general_average(
    student_id: &str,
    units: &[UnitDef],
    subjects: &[SubjectDef],
    grades: &[GradeRow],
) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for u in units {
        let Some(avg) = unit_average(student_id, &u.id, subjects, grades) else {
            continue;
        };
        sum += avg * u.coefficient;
        denom += u.coefficient;
    }
    if denom > 0.0 {
        Some(round1(sum / denom))
    } else {
        None
    }
}

/// Alternate "precise" general average: one end-to-end weighted computation
/// over unrounded subject means, rounded once at the end. The cascading
/// variant above stays the displayed default; the two may differ by a tenth
/// of a point on the same grade set.
#[allow(dead_code)]
pub fn general_average_precise(
    student_id: &str,
    units: &[UnitDef],
    subjects: &[SubjectDef],
    grades: &[GradeRow],
) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for u in units {
        let mut unit_sum = 0.0_f64;
        let mut unit_denom = 0.0_f64;
        for s in subjects.iter().filter(|s| s.unit_id == u.id) {
            let Some(mean) = subject_mean_unrounded(student_id, &s.id, grades) else {
                continue;
            };
            unit_sum += mean * s.coefficient;
            unit_denom += s.coefficient;
        }
        if unit_denom > 0.0 {
            sum += (unit_sum / unit_denom) * u.coefficient;
            denom += u.coefficient;
        }
    }
    if denom > 0.0 {
        Some(round1(sum / denom))
    } else {
        None
    }
}

/// Unweighted mean of a subject's averages across the cohort. Students
/// without an evaluation for the subject are left out of the denominator.
pub fn cohort_subject_average(
    subject_id: &str,
    cohort_student_ids: &[String],
    grades: &[GradeRow],
) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for sid in cohort_student_ids {
        if let Some(avg) = subject_average(sid, subject_id, grades) {
            sum += avg;
            count += 1;
        }
    }
    if count > 0 {
        Some(round1(sum / count as f64))
    } else {
        None
    }
}

/// Unweighted mean of a unit's per-student averages across the cohort,
/// with the same exclusion rule as `cohort_subject_average`.
pub fn cohort_unit_average(
    unit_id: &str,
    cohort_student_ids: &[String],
    subjects: &[SubjectDef],
    grades: &[GradeRow],
) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for sid in cohort_student_ids {
        if let Some(avg) = unit_average(sid, unit_id, subjects, grades) {
            sum += avg;
            count += 1;
        }
    }
    if count > 0 {
        Some(round1(sum / count as f64))
    } else {
        None
    }
}

/// Cohort-wide general average. A student with no general average counts
/// as 0 against the FULL cohort size here, unlike the per-student path
/// where absence propagates as `None`. Both behaviors are displayed in the
/// console; keep them distinct.
pub fn cohort_general_average(
    cohort_student_ids: &[String],
    units: &[UnitDef],
    subjects: &[SubjectDef],
    grades: &[GradeRow],
) -> Option<f64> {
    if cohort_student_ids.is_empty() {
        return None;
    }
    let total: f64 = cohort_student_ids
        .iter()
        .map(|sid| general_average(sid, units, subjects, grades).unwrap_or(0.0))
        .sum();
    Some(round1(total / cohort_student_ids.len() as f64))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedRow {
    pub student_id: String,
    pub general_average: Option<f64>,
    pub rank: usize,
}

/// Full ranking table for a cohort, best average first. Missing averages
/// order as 0. The sort is an index-tagged stable sort, so ties keep the
/// cohort's input order; there is no secondary tie-break.
pub fn rank_cohort(
    cohort_student_ids: &[String],
    general_averages: &HashMap<String, Option<f64>>,
) -> Vec<RankedRow> {
    let avg_of = |sid: &str| -> Option<f64> { general_averages.get(sid).copied().flatten() };

    let mut order: Vec<usize> = (0..cohort_student_ids.len()).collect();
    order.sort_by(|a, b| {
        let va = avg_of(&cohort_student_ids[*a]).unwrap_or(0.0);
        let vb = avg_of(&cohort_student_ids[*b]).unwrap_or(0.0);
        vb.partial_cmp(&va).unwrap_or(Ordering::Equal)
    });

    order
        .into_iter()
        .enumerate()
        .map(|(pos, i)| RankedRow {
            student_id: cohort_student_ids[i].clone(),
            general_average: avg_of(&cohort_student_ids[i]),
            rank: pos + 1,
        })
        .collect()
}

/// 1-based position of a student within the cohort ranking. `None` only
/// when the student is not part of the cohort list.
#[allow(dead_code)]
pub fn rank(
    student_id: &str,
    cohort_student_ids: &[String],
    general_averages: &HashMap<String, Option<f64>>,
) -> Option<usize> {
    rank_cohort(cohort_student_ids, general_averages)
        .into_iter()
        .find(|r| r.student_id == student_id)
        .map(|r| r.rank)
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: String,
    pub average: Option<f64>,
    pub evaluation_count: usize,
    pub cohort_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitLine {
    pub unit_id: String,
    pub average: Option<f64>,
    pub cohort_average: Option<f64>,
    pub subjects: Vec<SubjectLine>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBulletinRow {
    pub student_id: String,
    pub display_name: String,
    pub sort_order: i64,
    pub units: Vec<UnitLine>,
    pub general_average: Option<f64>,
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassBulletin {
    pub class: ClassInfo,
    pub units: Vec<UnitDef>,
    pub subjects: Vec<SubjectDef>,
    pub per_student: Vec<StudentBulletinRow>,
    pub cohort_general_average: Option<f64>,
    pub cohort_size: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBulletin {
    pub class: ClassInfo,
    pub units: Vec<UnitDef>,
    pub subjects: Vec<SubjectDef>,
    pub student: StudentBulletinRow,
    pub cohort_general_average: Option<f64>,
    pub cohort_size: usize,
}

struct BulletinStudent {
    id: String,
    display_name: String,
    sort_order: i64,
}

/// Loads one snapshot of the class's records and runs the whole hierarchy:
/// subject -> unit -> general -> cohort -> rank. Recomputed from scratch on
/// every call; nothing is cached between requests.
pub fn compute_class_bulletin(conn: &Connection, class_id: &str) -> Result<ClassBulletin, CalcError> {
    let class_name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some(class_name) = class_name else {
        return Err(CalcError::new("not_found", "class not found"));
    };

    let mut students_stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let students: Vec<BulletinStudent> = students_stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(BulletinStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                sort_order: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut units_stmt = conn
        .prepare(
            "SELECT id, name, coefficient, sort_order
             FROM teaching_units
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let units: Vec<UnitDef> = units_stmt
        .query_map([class_id], |r| {
            Ok(UnitDef {
                id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
                sort_order: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut subjects_stmt = conn
        .prepare(
            "SELECT s.id, s.unit_id, s.name, s.coefficient, s.sort_order
             FROM subjects s
             JOIN teaching_units u ON u.id = s.unit_id
             WHERE u.class_id = ?
             ORDER BY u.sort_order, s.sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let subjects: Vec<SubjectDef> = subjects_stmt
        .query_map([class_id], |r| {
            Ok(SubjectDef {
                id: r.get(0)?,
                unit_id: r.get(1)?,
                name: r.get(2)?,
                coefficient: r.get(3)?,
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut grades_stmt = conn
        .prepare(
            "SELECT g.student_id, g.subject_id, g.value
             FROM grades g
             JOIN students st ON st.id = g.student_id
             WHERE st.class_id = ?",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let grades: Vec<GradeRow> = grades_stmt
        .query_map([class_id], |r| {
            Ok(GradeRow {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                value: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let cohort: Vec<String> = students.iter().map(|s| s.id.clone()).collect();

    let mut general_by_student: HashMap<String, Option<f64>> = HashMap::new();
    for sid in &cohort {
        general_by_student.insert(sid.clone(), general_average(sid, &units, &subjects, &grades));
    }
    let ranking = rank_cohort(&cohort, &general_by_student);
    let rank_by_student: HashMap<&str, usize> = ranking
        .iter()
        .map(|r| (r.student_id.as_str(), r.rank))
        .collect();

    let mut cohort_by_subject: HashMap<&str, Option<f64>> = HashMap::new();
    for s in &subjects {
        cohort_by_subject.insert(s.id.as_str(), cohort_subject_average(&s.id, &cohort, &grades));
    }
    let mut cohort_by_unit: HashMap<&str, Option<f64>> = HashMap::new();
    for u in &units {
        cohort_by_unit.insert(
            u.id.as_str(),
            cohort_unit_average(&u.id, &cohort, &subjects, &grades),
        );
    }

    let mut per_student: Vec<StudentBulletinRow> = Vec::new();
    for st in &students {
        let mut unit_lines: Vec<UnitLine> = Vec::new();
        for u in &units {
            let subject_lines: Vec<SubjectLine> = subjects
                .iter()
                .filter(|s| s.unit_id == u.id)
                .map(|s| SubjectLine {
                    subject_id: s.id.clone(),
                    average: subject_average(&st.id, &s.id, &grades),
                    evaluation_count: matching_values(&st.id, &s.id, &grades).len(),
                    cohort_average: cohort_by_subject.get(s.id.as_str()).copied().flatten(),
                })
                .collect();
            unit_lines.push(UnitLine {
                unit_id: u.id.clone(),
                average: unit_average(&st.id, &u.id, &subjects, &grades),
                cohort_average: cohort_by_unit.get(u.id.as_str()).copied().flatten(),
                subjects: subject_lines,
            });
        }

        per_student.push(StudentBulletinRow {
            student_id: st.id.clone(),
            display_name: st.display_name.clone(),
            sort_order: st.sort_order,
            units: unit_lines,
            general_average: general_by_student.get(&st.id).copied().flatten(),
            rank: rank_by_student.get(st.id.as_str()).copied().unwrap_or(0),
        });
    }

    let cohort_avg = cohort_general_average(&cohort, &units, &subjects, &grades);

    Ok(ClassBulletin {
        class: ClassInfo {
            id: class_id.to_string(),
            name: class_name,
        },
        units,
        subjects,
        per_student,
        cohort_general_average: cohort_avg,
        cohort_size: cohort.len(),
    })
}

/// Single-student projection of the class bulletin. The detail view and the
/// printable template both consume this, so their numbers cannot drift from
/// the class table.
pub fn compute_student_bulletin(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<StudentBulletin, CalcError> {
    let model = compute_class_bulletin(conn, class_id)?;
    let student = model
        .per_student
        .into_iter()
        .find(|r| r.student_id == student_id)
        .ok_or_else(|| CalcError::new("not_found", "student not found"))?;
    Ok(StudentBulletin {
        class: model.class,
        units: model.units,
        subjects: model.subjects,
        student,
        cohort_general_average: model.cohort_general_average,
        cohort_size: model.cohort_size,
    })
}
